//! Duplicate detection for incoming external messages.
//!
//! Two layers: an exact lookup on the (external id, account) mapping key, and
//! a content-based fallback that catches provider redeliveries under a fresh
//! external id as well as webhook/poll races. The detector fails open: a
//! lookup error is logged and the message is treated as new, because dropping
//! a legitimate message silently is worse than importing a duplicate the
//! mapping key will still reject.

use std::sync::Arc;

use chrono::Duration;
use tracing::warn;

use threadline_core::domain::customer::SourceAccountId;
use threadline_core::domain::message::MessageId;
use threadline_core::phone;
use threadline_db::repositories::MessageRepository;

use crate::source::ExternalMessage;

const EXACT_MATCH_CONFIDENCE: f64 = 1.0;
const CONTENT_MATCH_CONFIDENCE: f64 = 0.9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DuplicateDetectorConfig {
    /// Tolerance for the content-based check: identical phone/body/direction
    /// within this window around the incoming timestamp counts as the same
    /// logical message.
    pub window_hours: i64,
}

impl Default for DuplicateDetectorConfig {
    fn default() -> Self {
        Self { window_hours: 24 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DuplicateCheck {
    pub duplicate: bool,
    pub matched_message_id: Option<MessageId>,
    pub confidence: f64,
}

impl DuplicateCheck {
    fn not_duplicate() -> Self {
        Self { duplicate: false, matched_message_id: None, confidence: 0.0 }
    }
}

pub struct DuplicateDetector {
    messages: Arc<dyn MessageRepository>,
    config: DuplicateDetectorConfig,
}

impl DuplicateDetector {
    pub fn new(messages: Arc<dyn MessageRepository>, config: DuplicateDetectorConfig) -> Self {
        Self { messages, config }
    }

    pub async fn check(
        &self,
        external: &ExternalMessage,
        account_id: &SourceAccountId,
    ) -> DuplicateCheck {
        match self.check_inner(external, account_id).await {
            Ok(check) => check,
            Err(error) => {
                warn!(
                    event_name = "sync.dedup.check_failed",
                    account_id = %account_id.0,
                    external_message_id = %external.external_id,
                    error = %error,
                    "duplicate check failed, treating message as new"
                );
                DuplicateCheck::not_duplicate()
            }
        }
    }

    async fn check_inner(
        &self,
        external: &ExternalMessage,
        account_id: &SourceAccountId,
    ) -> Result<DuplicateCheck, threadline_db::repositories::RepositoryError> {
        if let Some(message_id) =
            self.messages.find_mapped_message(&external.external_id, account_id).await?
        {
            return Ok(DuplicateCheck {
                duplicate: true,
                matched_message_id: Some(message_id),
                confidence: EXACT_MATCH_CONFIDENCE,
            });
        }

        // Content fallback needs a comparable phone; an unparseable number
        // is the pipeline's problem, not a duplicate.
        let Ok(normalized_phone) = phone::normalize(&external.phone_number) else {
            return Ok(DuplicateCheck::not_duplicate());
        };

        let window = Duration::hours(self.config.window_hours);
        if let Some(message_id) = self
            .messages
            .find_content_match(
                &normalized_phone,
                &external.body,
                external.direction,
                external.sent_at - window,
                external.sent_at + window,
            )
            .await?
        {
            return Ok(DuplicateCheck {
                duplicate: true,
                matched_message_id: Some(message_id),
                confidence: CONTENT_MATCH_CONFIDENCE,
            });
        }

        Ok(DuplicateCheck::not_duplicate())
    }
}
