//! Drives the paginated fetch loop for one external account at a time,
//! owns per-session progress state, and applies the error budget.
//!
//! Each `start_sync` call runs as an independent tokio task. Live progress is
//! served from an in-memory registry owned by the orchestrator; persisted
//! `sync_session` rows are the source of truth for resumability, the registry
//! only backs live polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use threadline_core::config::SyncConfig;
use threadline_core::domain::customer::SourceAccountId;
use threadline_core::domain::sync::{
    SyncCounters, SyncSession, SyncSessionId, SyncSessionStatus, SyncType,
};
use threadline_db::repositories::{RepositoryError, SyncSessionRepository};

use crate::identity::MatchType;
use crate::pipeline::{IngestOutcome, MessagePipeline};
use crate::source::{FetchPageRequest, MessageSourceClient};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    pub sync_type: SyncType,
    /// Manual syncs only: caller-supplied window and cursor.
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { sync_type: SyncType::Incremental, start_time: None, end_time: None, cursor: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub session_id: SyncSessionId,
    pub account_id: SourceAccountId,
    pub sync_type: SyncType,
    pub status: SyncSessionStatus,
    pub counters: SyncCounters,
    pub last_cursor: Option<String>,
    pub last_message_date: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&SyncSession> for SyncProgress {
    fn from(session: &SyncSession) -> Self {
        Self {
            session_id: session.id.clone(),
            account_id: session.source_account_id.clone(),
            sync_type: session.sync_type,
            status: session.status,
            counters: session.counters,
            last_cursor: session.last_cursor.clone(),
            last_message_date: session.last_message_date,
            error_message: session.error_message.clone(),
            started_at: session.started_at,
            completed_at: session.completed_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already in flight for account `{0}`")]
    AlreadyRunning(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncOrchestratorConfig {
    pub page_size: u32,
    /// Total per-message processing errors tolerated per session.
    pub error_budget: u32,
    pub page_delay_ms: u64,
    pub max_history_days: i64,
    pub incremental_lookback_hours: i64,
}

impl Default for SyncOrchestratorConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            error_budget: 5,
            page_delay_ms: 250,
            max_history_days: 90,
            incremental_lookback_hours: 24,
        }
    }
}

impl From<&SyncConfig> for SyncOrchestratorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            error_budget: config.error_budget,
            page_delay_ms: config.page_delay_ms,
            max_history_days: config.max_history_days,
            incremental_lookback_hours: config.incremental_lookback_hours,
        }
    }
}

struct SessionHandle {
    progress: SyncProgress,
    cancel_requested: bool,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    source: Arc<dyn MessageSourceClient>,
    pipeline: Arc<MessagePipeline>,
    sessions: Arc<dyn SyncSessionRepository>,
    registry: Arc<Mutex<HashMap<String, SessionHandle>>>,
    config: SyncOrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn MessageSourceClient>,
        pipeline: Arc<MessagePipeline>,
        sessions: Arc<dyn SyncSessionRepository>,
        config: SyncOrchestratorConfig,
    ) -> Self {
        Self { source, pipeline, sessions, registry: Arc::new(Mutex::new(HashMap::new())), config }
    }

    /// Starts a sync task for the account and returns its session id.
    /// Rejects with [`SyncError::AlreadyRunning`] while another session for
    /// the same account is in flight.
    pub async fn start_sync(
        &self,
        account_id: SourceAccountId,
        options: SyncOptions,
    ) -> Result<SyncSessionId, SyncError> {
        if let Some(existing) = self.sessions.find_in_flight_for_account(&account_id).await? {
            return Err(SyncError::AlreadyRunning(existing.source_account_id.0));
        }

        let session = SyncSession::start(account_id.clone(), options.sync_type);
        let session_id = session.id.clone();

        {
            let mut registry = self.registry.lock().await;
            let in_flight = registry.values().any(|handle| {
                handle.progress.account_id == account_id && !handle.progress.status.is_terminal()
            });
            if in_flight {
                return Err(SyncError::AlreadyRunning(account_id.0));
            }
            registry.insert(
                session_id.0.clone(),
                SessionHandle { progress: SyncProgress::from(&session), cancel_requested: false },
            );
        }

        if let Err(error) = self.sessions.save(session.clone()).await {
            let mut registry = self.registry.lock().await;
            registry.remove(&session_id.0);
            return Err(error.into());
        }

        info!(
            event_name = "sync.session.start",
            session_id = %session_id.0,
            account_id = %account_id.0,
            sync_type = session.sync_type.as_str(),
            "sync session starting"
        );

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_session(session, options).await;
        });

        Ok(session_id)
    }

    /// Live progress for a session, falling back to the persisted row for
    /// sessions that finished before this process started polling.
    pub async fn progress(
        &self,
        session_id: &SyncSessionId,
    ) -> Result<Option<SyncProgress>, RepositoryError> {
        {
            let registry = self.registry.lock().await;
            if let Some(handle) = registry.get(&session_id.0) {
                return Ok(Some(handle.progress.clone()));
            }
        }

        Ok(self.sessions.find_by_id(session_id).await?.as_ref().map(SyncProgress::from))
    }

    /// Requests cooperative cancellation. The in-flight page finishes; the
    /// loop stops before fetching the next one. Returns false for unknown or
    /// already-terminal sessions.
    pub async fn cancel(&self, session_id: &SyncSessionId) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.get_mut(&session_id.0) {
            Some(handle) if !handle.progress.status.is_terminal() => {
                handle.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    async fn run_session(&self, mut session: SyncSession, options: SyncOptions) {
        session.status = SyncSessionStatus::Running;
        session.updated_at = Utc::now();
        if let Err(error) = self.persist(&session).await {
            error!(
                event_name = "sync.session.persist_failed",
                session_id = %session.id.0,
                error = %error,
                "could not mark session running"
            );
            self.finalize(&mut session, SyncSessionStatus::Failed, Some(error.to_string())).await;
            return;
        }

        let (mut cursor, start_time, end_time) = match self.resolve_window(&session, &options).await
        {
            Ok(window) => window,
            Err(error) => {
                self.finalize(&mut session, SyncSessionStatus::Failed, Some(error.to_string()))
                    .await;
                return;
            }
        };

        loop {
            if self.cancel_requested(&session.id).await {
                info!(
                    event_name = "sync.session.cancelled",
                    session_id = %session.id.0,
                    "cancellation requested, stopping before next page"
                );
                self.finalize(&mut session, SyncSessionStatus::Cancelled, None).await;
                return;
            }

            let request = FetchPageRequest {
                cursor: cursor.clone(),
                start_time,
                end_time,
                page_size: self.config.page_size,
            };
            let page = match self.source.fetch_page(&session.source_account_id, request).await {
                Ok(page) => page,
                Err(source_error) => {
                    // The source client owns transient retries; an error here
                    // means they are exhausted and the session is done.
                    error!(
                        event_name = "sync.session.fetch_failed",
                        session_id = %session.id.0,
                        error = %source_error,
                        "page fetch failed, failing session"
                    );
                    self.finalize(
                        &mut session,
                        SyncSessionStatus::Failed,
                        Some(source_error.to_string()),
                    )
                    .await;
                    return;
                }
            };

            let budget_exhausted = self.process_page(&mut session, &page.messages).await;
            if budget_exhausted {
                let errors_encountered = session.counters.errors_encountered;
                self.finalize(
                    &mut session,
                    SyncSessionStatus::Failed,
                    Some(format!(
                        "error budget exhausted after {} processing errors",
                        errors_encountered
                    )),
                )
                .await;
                return;
            }

            if let Some(next_cursor) = &page.next_cursor {
                session.last_cursor = Some(next_cursor.clone());
            }
            session.updated_at = Utc::now();
            if let Err(persist_error) = self.persist(&session).await {
                warn!(
                    event_name = "sync.session.persist_failed",
                    session_id = %session.id.0,
                    error = %persist_error,
                    "progress snapshot not persisted, continuing"
                );
            }

            match page.next_cursor {
                None => {
                    self.finalize(&mut session, SyncSessionStatus::Completed, None).await;
                    return;
                }
                Some(next_cursor) => {
                    cursor = Some(next_cursor);
                    if self.config.page_delay_ms > 0 {
                        tokio::time::sleep(StdDuration::from_millis(self.config.page_delay_ms))
                            .await;
                    }
                }
            }
        }
    }

    /// Runs every message in the page through the pipeline sequentially
    /// (ordering matters: parallel imports could race duplicate customers or
    /// threads for one number). Returns true once the error budget is spent.
    async fn process_page(
        &self,
        session: &mut SyncSession,
        messages: &[crate::source::ExternalMessage],
    ) -> bool {
        for external in messages {
            match self.pipeline.ingest(external, &session.source_account_id).await {
                Ok(IngestOutcome::Imported { customer_match, .. }) => {
                    session.counters.messages_processed += 1;
                    match customer_match {
                        MatchType::Created => session.counters.customers_created += 1,
                        MatchType::Exact | MatchType::Fuzzy => {
                            session.counters.customers_matched += 1
                        }
                        MatchType::None => {}
                    }
                    session.last_message_date = Some(
                        session
                            .last_message_date
                            .map_or(external.sent_at, |current| current.max(external.sent_at)),
                    );
                }
                Ok(IngestOutcome::Duplicate { .. }) => {
                    session.counters.duplicates_skipped += 1;
                    session.last_message_date = Some(
                        session
                            .last_message_date
                            .map_or(external.sent_at, |current| current.max(external.sent_at)),
                    );
                }
                Ok(IngestOutcome::Skipped(reason)) => {
                    session.counters.malformed_skipped += 1;
                    warn!(
                        event_name = "sync.message.malformed",
                        session_id = %session.id.0,
                        external_message_id = %external.external_id,
                        reason = reason.as_str(),
                        "skipping malformed message"
                    );
                }
                Err(pipeline_error) => {
                    session.counters.errors_encountered += 1;
                    warn!(
                        event_name = "sync.message.failed",
                        session_id = %session.id.0,
                        external_message_id = %external.external_id,
                        error = %pipeline_error,
                        errors_encountered = session.counters.errors_encountered,
                        "message processing failed, skipping"
                    );
                    if session.counters.errors_encountered >= self.config.error_budget {
                        return true;
                    }
                }
            }

            self.update_registry(session).await;
        }

        false
    }

    async fn resolve_window(
        &self,
        session: &SyncSession,
        options: &SyncOptions,
    ) -> Result<(Option<String>, Option<DateTime<Utc>>, Option<DateTime<Utc>>), RepositoryError>
    {
        let now = Utc::now();
        match session.sync_type {
            SyncType::Initial => {
                Ok((None, Some(now - Duration::days(self.config.max_history_days)), None))
            }
            SyncType::Incremental => {
                match self.sessions.last_completed_for_account(&session.source_account_id).await? {
                    Some(previous) => {
                        Ok((previous.last_cursor.clone(), previous.last_message_date, None))
                    }
                    None => Ok((
                        None,
                        Some(now - Duration::hours(self.config.incremental_lookback_hours)),
                        None,
                    )),
                }
            }
            SyncType::Manual => {
                Ok((options.cursor.clone(), options.start_time, options.end_time))
            }
        }
    }

    async fn finalize(
        &self,
        session: &mut SyncSession,
        status: SyncSessionStatus,
        error_message: Option<String>,
    ) {
        session.status = status;
        session.error_message = error_message;
        session.completed_at = Some(Utc::now());
        session.updated_at = session.completed_at.unwrap_or_else(Utc::now);

        if let Err(persist_error) = self.persist(session).await {
            error!(
                event_name = "sync.session.persist_failed",
                session_id = %session.id.0,
                error = %persist_error,
                "terminal session state not persisted"
            );
        }
        self.update_registry(session).await;

        info!(
            event_name = "sync.session.finished",
            session_id = %session.id.0,
            account_id = %session.source_account_id.0,
            status = session.status.as_str(),
            messages_processed = session.counters.messages_processed,
            customers_created = session.counters.customers_created,
            duplicates_skipped = session.counters.duplicates_skipped,
            errors_encountered = session.counters.errors_encountered,
            "sync session finished"
        );
    }

    async fn persist(&self, session: &SyncSession) -> Result<(), RepositoryError> {
        self.sessions.save(session.clone()).await
    }

    async fn update_registry(&self, session: &SyncSession) {
        let mut registry = self.registry.lock().await;
        if let Some(handle) = registry.get_mut(&session.id.0) {
            handle.progress = SyncProgress::from(session);
        }
    }

    async fn cancel_requested(&self, session_id: &SyncSessionId) -> bool {
        let registry = self.registry.lock().await;
        registry.get(&session_id.0).map(|handle| handle.cancel_requested).unwrap_or(false)
    }
}
