//! Persists one routed message. Side effects only: all dedup, identity, and
//! threading decisions happen upstream.

use std::sync::Arc;

use chrono::Utc;

use threadline_core::classify::MessageClassifier;
use threadline_core::domain::conversation::ConversationId;
use threadline_core::domain::customer::{CustomerId, SourceAccountId};
use threadline_core::domain::message::{ExternalIdMapping, Message, MessageId};
use threadline_db::repositories::{MessageRepository, RepositoryError};

use crate::source::ExternalMessage;

pub struct MessageImporter {
    messages: Arc<dyn MessageRepository>,
    classifier: Arc<dyn MessageClassifier>,
}

impl MessageImporter {
    pub fn new(messages: Arc<dyn MessageRepository>, classifier: Arc<dyn MessageClassifier>) -> Self {
        Self { messages, classifier }
    }

    /// Writes the message row, its external-id mapping, and the phone-mapping
    /// upsert as one transactional unit. `phone` must be E.164. A mapping
    /// conflict propagates as [`RepositoryError::MappingConflict`]: the
    /// detector should have caught the duplicate, so the conflict is a bug to
    /// surface, not a retry path.
    pub async fn import(
        &self,
        conversation_id: &ConversationId,
        external: &ExternalMessage,
        account_id: &SourceAccountId,
        customer_id: &CustomerId,
        phone: &str,
    ) -> Result<Message, RepositoryError> {
        let now = Utc::now();
        let message = Message {
            id: MessageId::generate(),
            conversation_id: conversation_id.clone(),
            direction: external.direction,
            content: external.body.clone(),
            sent_at: external.sent_at,
            emergency: self.classifier.is_emergency(&external.body),
            created_at: now,
        };
        let mapping = ExternalIdMapping {
            external_message_id: external.external_id.clone(),
            source_account_id: account_id.clone(),
            message_id: message.id.clone(),
            created_at: now,
        };

        self.messages.import(message.clone(), mapping, customer_id, phone).await?;
        Ok(message)
    }
}
