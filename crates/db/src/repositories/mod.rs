use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use threadline_core::domain::conversation::{Conversation, ConversationId, ConversationKey};
use threadline_core::domain::customer::{Customer, CustomerId, PhoneMapping, SourceAccountId};
use threadline_core::domain::message::{ExternalIdMapping, Message, MessageDirection, MessageId};
use threadline_core::domain::sync::{SyncSession, SyncSessionId};

pub mod conversation;
pub mod customer;
pub mod memory;
pub mod message;
pub mod sync_session;

pub use conversation::SqlConversationRepository;
pub use customer::SqlCustomerRepository;
pub use memory::{
    InMemoryConversationRepository, InMemoryCustomerRepository, InMemoryMessageRepository,
    InMemorySyncSessionRepository,
};
pub use message::SqlMessageRepository;
pub use sync_session::SqlSyncSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    /// The unique key on (external_message_id, source_account_id) was hit.
    /// Duplicate detection should have caught this upstream, so the conflict
    /// signals a dedup bug rather than a retry path.
    #[error("external id mapping already exists for `{external_message_id}` on account `{account_id}`")]
    MappingConflict { external_message_id: String, account_id: String },
}

#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn find_by_id(&self, id: &CustomerId) -> Result<Option<Customer>, RepositoryError>;

    async fn find_by_primary_phone(&self, phone: &str)
        -> Result<Option<Customer>, RepositoryError>;

    async fn find_by_alternate_phone(
        &self,
        phone: &str,
    ) -> Result<Option<Customer>, RepositoryError>;

    /// Candidates for fuzzy name/email matching.
    async fn list_active(&self) -> Result<Vec<Customer>, RepositoryError>;

    async fn save(&self, customer: Customer) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn find_active_for_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// Most recently updated `resolved` conversation for the key with
    /// `last_message_at` at or after `since`.
    async fn find_recent_resolved_for_key(
        &self,
        key: &ConversationKey,
        since: DateTime<Utc>,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// Non-archived conversations for the key created at or after
    /// `created_since`, most recently updated first. Input to the merge scan.
    async fn list_open_for_key(
        &self,
        key: &ConversationKey,
        created_since: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, RepositoryError>;

    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError>;

    /// Exact dedup lookup on the (external id, account) unique key.
    async fn find_mapped_message(
        &self,
        external_message_id: &str,
        account_id: &SourceAccountId,
    ) -> Result<Option<MessageId>, RepositoryError>;

    /// Fuzzy dedup lookup: same phone, content, and direction, sent between
    /// `window_start` and `window_end` inclusive.
    async fn find_content_match(
        &self,
        phone: &str,
        content: &str,
        direction: MessageDirection,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<MessageId>, RepositoryError>;

    /// Persist one imported message as a single transactional unit: the
    /// message row, its external-id mapping, and the phone-mapping upsert
    /// keyed on (account, `phone`). `phone` must be E.164.
    async fn import(
        &self,
        message: Message,
        mapping: ExternalIdMapping,
        customer_id: &CustomerId,
        phone: &str,
    ) -> Result<(), RepositoryError>;

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// Re-point every message from one conversation to another. Returns the
    /// number of rows moved. Used by conversation merging.
    async fn reassign_conversation(
        &self,
        from: &ConversationId,
        to: &ConversationId,
    ) -> Result<u64, RepositoryError>;

    async fn find_phone_mapping(
        &self,
        account_id: &SourceAccountId,
        phone: &str,
    ) -> Result<Option<PhoneMapping>, RepositoryError>;
}

#[async_trait]
pub trait SyncSessionRepository: Send + Sync {
    async fn find_by_id(&self, id: &SyncSessionId) -> Result<Option<SyncSession>, RepositoryError>;

    /// A `pending` or `running` session for the account, if any. Used to
    /// enforce at most one concurrent sync per account.
    async fn find_in_flight_for_account(
        &self,
        account_id: &SourceAccountId,
    ) -> Result<Option<SyncSession>, RepositoryError>;

    /// Most recent `completed` session for the account; failed and cancelled
    /// sessions never contribute a resume point.
    async fn last_completed_for_account(
        &self,
        account_id: &SourceAccountId,
    ) -> Result<Option<SyncSession>, RepositoryError>;

    async fn save(&self, session: SyncSession) -> Result<(), RepositoryError>;
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}
