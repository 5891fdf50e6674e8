pub mod classify;
pub mod config;
pub mod domain;
pub mod phone;

pub use classify::{KeywordClassifier, KeywordClassifierConfig, MessageClassifier};
pub use domain::conversation::{
    Conversation, ConversationId, ConversationKey, ConversationPriority, ConversationStatus,
};
pub use domain::customer::{Customer, CustomerId, PhoneMapping, SourceAccountId};
pub use domain::message::{ExternalIdMapping, Message, MessageDirection, MessageId};
pub use domain::sync::{
    SyncCounters, SyncSession, SyncSessionId, SyncSessionStatus, SyncType,
};
pub use phone::PhoneError;

pub use chrono;
