use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::customer::SourceAccountId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncSessionId(pub String);

impl SyncSessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Initial,
    Incremental,
    Manual,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Incremental => "incremental",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "initial" => Some(Self::Initial),
            "incremental" => Some(Self::Incremental),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states freeze counters; the session row is never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Progress counters for one sync run. Embedded in [`SyncSession`] and also
/// served live from the orchestrator's registry while the run is in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub messages_processed: u32,
    pub customers_created: u32,
    pub customers_matched: u32,
    pub duplicates_skipped: u32,
    pub malformed_skipped: u32,
    pub errors_encountered: u32,
}

/// One run of the batch synchronization loop for one external account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SyncSessionId,
    pub source_account_id: SourceAccountId,
    pub sync_type: SyncType,
    pub status: SyncSessionStatus,
    pub counters: SyncCounters,
    pub last_cursor: Option<String>,
    pub last_message_date: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncSession {
    pub fn start(account_id: SourceAccountId, sync_type: SyncType) -> Self {
        let now = Utc::now();
        Self {
            id: SyncSessionId::generate(),
            source_account_id: account_id,
            sync_type,
            status: SyncSessionStatus::Pending,
            counters: SyncCounters::default(),
            last_cursor: None,
            last_message_date: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
