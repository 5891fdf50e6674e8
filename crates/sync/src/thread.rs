//! Conversation resolution: route an incoming message onto the one thread it
//! belongs to, creating, reactivating, or merging threads as needed.
//!
//! Post-condition of every resolve call: exactly one `active` conversation
//! exists for the (customer, phone, platform) key.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use threadline_core::classify::MessageClassifier;
use threadline_core::domain::conversation::{
    Conversation, ConversationId, ConversationKey, ConversationPriority, ConversationStatus,
};
use threadline_core::domain::customer::CustomerId;
use threadline_db::repositories::{ConversationRepository, MessageRepository, RepositoryError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversationResolverConfig {
    /// A resolved thread with traffic this recent may be reactivated instead
    /// of opening a new thread.
    pub reactivation_window_hours: i64,
    /// Duplicate threads created within this window are folded into one.
    pub merge_window_days: i64,
}

impl Default for ConversationResolverConfig {
    fn default() -> Self {
        Self { reactivation_window_hours: 24, merge_window_days: 7 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConversation {
    pub conversation: Conversation,
    pub is_new: bool,
    /// Conversations archived into the returned one by this call.
    pub merged: Vec<ConversationId>,
}

pub struct ConversationResolver {
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    classifier: Arc<dyn MessageClassifier>,
    config: ConversationResolverConfig,
}

impl ConversationResolver {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        classifier: Arc<dyn MessageClassifier>,
        config: ConversationResolverConfig,
    ) -> Self {
        Self { conversations, messages, classifier, config }
    }

    /// `phone` must already be normalized to E.164. `body` is `None` when the
    /// caller has no text to classify (for example a voicemail notification);
    /// reactivation then defaults to resuming the recent thread.
    pub async fn resolve(
        &self,
        customer_id: &CustomerId,
        phone: &str,
        platform: &str,
        body: Option<&str>,
        external_thread_id: Option<&str>,
        sent_at: DateTime<Utc>,
    ) -> Result<ResolvedConversation, RepositoryError> {
        let key = ConversationKey {
            customer_id: customer_id.clone(),
            phone_number: phone.to_string(),
            platform: platform.to_string(),
        };
        let now = Utc::now();

        // Concurrent imports can race a second active thread into existence
        // for the same key. Fold duplicates before anything else so the
        // single-active invariant holds no matter which path returns. The
        // merge sweeps up every non-archived thread created in the window.
        let merge_cutoff = now - Duration::days(self.config.merge_window_days);
        let open = self.conversations.list_open_for_key(&key, merge_cutoff).await?;
        let active_count =
            open.iter().filter(|thread| thread.status == ConversationStatus::Active).count();
        if active_count > 1 {
            return self.merge_duplicates(open, sent_at, now).await;
        }

        if let Some(mut active) = self.conversations.find_active_for_key(&key).await? {
            active.last_message_at = active.last_message_at.max(sent_at);
            active.updated_at = now;
            self.conversations.save(active.clone()).await?;
            return Ok(ResolvedConversation { conversation: active, is_new: false, merged: vec![] });
        }

        let reactivation_cutoff = now - Duration::hours(self.config.reactivation_window_hours);
        if let Some(mut resolved) =
            self.conversations.find_recent_resolved_for_key(&key, reactivation_cutoff).await?
        {
            let resume = match body {
                Some(body) => self.classifier.is_follow_up(body),
                None => true,
            };
            if resume {
                resolved.status = ConversationStatus::Active;
                resolved.last_message_at = resolved.last_message_at.max(sent_at);
                resolved.updated_at = now;
                self.conversations.save(resolved.clone()).await?;
                info!(
                    event_name = "sync.conversation.reactivated",
                    conversation_id = %resolved.id.0,
                    customer_id = %customer_id.0,
                    "reactivated recently resolved conversation"
                );
                return Ok(ResolvedConversation {
                    conversation: resolved,
                    is_new: false,
                    merged: vec![],
                });
            }
        }

        let priority = match body {
            Some(body) => self.classifier.priority(body),
            None => ConversationPriority::Medium,
        };
        let conversation = Conversation {
            id: ConversationId::generate(),
            customer_id: customer_id.clone(),
            phone_number: phone.to_string(),
            platform: platform.to_string(),
            status: ConversationStatus::Active,
            priority,
            last_message_at: sent_at,
            external_thread_id: external_thread_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.conversations.save(conversation.clone()).await?;

        Ok(ResolvedConversation { conversation, is_new: true, merged: vec![] })
    }

    /// Fold duplicate open threads into the most recently updated one:
    /// messages are re-pointed first, then the losers are archived, so an
    /// interruption between the two leaves only re-mergeable duplicates
    /// behind, never orphaned messages.
    async fn merge_duplicates(
        &self,
        open: Vec<Conversation>,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ResolvedConversation, RepositoryError> {
        let mut iter = open.into_iter();
        let mut canonical = match iter.next() {
            Some(conversation) => conversation,
            None => {
                return Err(RepositoryError::Decode(
                    "merge_duplicates called with no conversations".to_string(),
                ))
            }
        };
        let losers: Vec<Conversation> = iter.collect();

        let mut merged = Vec::with_capacity(losers.len());
        for mut loser in losers {
            let moved = self.messages.reassign_conversation(&loser.id, &canonical.id).await?;
            canonical.last_message_at = canonical.last_message_at.max(loser.last_message_at);
            if canonical.priority < loser.priority {
                canonical.priority = loser.priority;
            }

            loser.status = ConversationStatus::Archived;
            loser.updated_at = now;
            self.conversations.save(loser.clone()).await?;

            info!(
                event_name = "sync.conversation.merged",
                canonical_id = %canonical.id.0,
                merged_id = %loser.id.0,
                messages_moved = moved,
                "merged duplicate conversation"
            );
            merged.push(loser.id);
        }

        canonical.status = ConversationStatus::Active;
        canonical.last_message_at = canonical.last_message_at.max(sent_at);
        canonical.updated_at = now;
        self.conversations.save(canonical.clone()).await?;

        Ok(ResolvedConversation { conversation: canonical, is_new: false, merged })
    }
}
