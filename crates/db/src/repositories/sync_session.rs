use sqlx::{sqlite::SqliteRow, Row};

use threadline_core::domain::customer::SourceAccountId;
use threadline_core::domain::sync::{
    SyncCounters, SyncSession, SyncSessionId, SyncSessionStatus, SyncType,
};

use super::{
    parse_optional_timestamp, parse_timestamp, parse_u32, RepositoryError, SyncSessionRepository,
};
use crate::DbPool;

const SESSION_COLUMNS: &str = "id,
                source_account_id,
                sync_type,
                status,
                messages_processed,
                customers_created,
                customers_matched,
                duplicates_skipped,
                malformed_skipped,
                errors_encountered,
                last_cursor,
                last_message_date,
                error_message,
                started_at,
                completed_at,
                created_at,
                updated_at";

pub struct SqlSyncSessionRepository {
    pool: DbPool,
}

impl SqlSyncSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SyncSessionRepository for SqlSyncSessionRepository {
    async fn find_by_id(&self, id: &SyncSessionId) -> Result<Option<SyncSession>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_session WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn find_in_flight_for_account(
        &self,
        account_id: &SourceAccountId,
    ) -> Result<Option<SyncSession>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_session
             WHERE source_account_id = ? AND status IN ('pending', 'running')
             ORDER BY started_at DESC
             LIMIT 1"
        ))
        .bind(&account_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn last_completed_for_account(
        &self,
        account_id: &SourceAccountId,
    ) -> Result<Option<SyncSession>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_session
             WHERE source_account_id = ? AND status = 'completed'
             ORDER BY completed_at DESC
             LIMIT 1"
        ))
        .bind(&account_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn save(&self, session: SyncSession) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO sync_session (
                id,
                source_account_id,
                sync_type,
                status,
                messages_processed,
                customers_created,
                customers_matched,
                duplicates_skipped,
                malformed_skipped,
                errors_encountered,
                last_cursor,
                last_message_date,
                error_message,
                started_at,
                completed_at,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                source_account_id = excluded.source_account_id,
                sync_type = excluded.sync_type,
                status = excluded.status,
                messages_processed = excluded.messages_processed,
                customers_created = excluded.customers_created,
                customers_matched = excluded.customers_matched,
                duplicates_skipped = excluded.duplicates_skipped,
                malformed_skipped = excluded.malformed_skipped,
                errors_encountered = excluded.errors_encountered,
                last_cursor = excluded.last_cursor,
                last_message_date = excluded.last_message_date,
                error_message = excluded.error_message,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at",
        )
        .bind(&session.id.0)
        .bind(&session.source_account_id.0)
        .bind(session.sync_type.as_str())
        .bind(session.status.as_str())
        .bind(i64::from(session.counters.messages_processed))
        .bind(i64::from(session.counters.customers_created))
        .bind(i64::from(session.counters.customers_matched))
        .bind(i64::from(session.counters.duplicates_skipped))
        .bind(i64::from(session.counters.malformed_skipped))
        .bind(i64::from(session.counters.errors_encountered))
        .bind(session.last_cursor.as_deref())
        .bind(session.last_message_date.map(|value| value.to_rfc3339()))
        .bind(session.error_message.as_deref())
        .bind(session.started_at.to_rfc3339())
        .bind(session.completed_at.map(|value| value.to_rfc3339()))
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn session_from_row(row: SqliteRow) -> Result<SyncSession, RepositoryError> {
    let sync_type_raw = row.try_get::<String, _>("sync_type")?;
    let sync_type = SyncType::parse(&sync_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sync type `{sync_type_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = SyncSessionStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown sync session status `{status_raw}`"))
    })?;

    Ok(SyncSession {
        id: SyncSessionId(row.try_get("id")?),
        source_account_id: SourceAccountId(row.try_get("source_account_id")?),
        sync_type,
        status,
        counters: SyncCounters {
            messages_processed: parse_u32(
                "messages_processed",
                row.try_get("messages_processed")?,
            )?,
            customers_created: parse_u32("customers_created", row.try_get("customers_created")?)?,
            customers_matched: parse_u32("customers_matched", row.try_get("customers_matched")?)?,
            duplicates_skipped: parse_u32(
                "duplicates_skipped",
                row.try_get("duplicates_skipped")?,
            )?,
            malformed_skipped: parse_u32("malformed_skipped", row.try_get("malformed_skipped")?)?,
            errors_encountered: parse_u32(
                "errors_encountered",
                row.try_get("errors_encountered")?,
            )?,
        },
        last_cursor: row.try_get("last_cursor")?,
        last_message_date: parse_optional_timestamp(
            "last_message_date",
            row.try_get("last_message_date")?,
        )?,
        error_message: row.try_get("error_message")?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use threadline_core::domain::customer::SourceAccountId;
    use threadline_core::domain::sync::{SyncSession, SyncSessionStatus, SyncType};

    use super::SqlSyncSessionRepository;
    use crate::migrations;
    use crate::repositories::SyncSessionRepository;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn account() -> SourceAccountId {
        SourceAccountId("acct-sync".to_string())
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let pool = setup_pool().await;
        let repo = SqlSyncSessionRepository::new(pool.clone());

        let mut session = SyncSession::start(account(), SyncType::Initial);
        session.counters.messages_processed = 7;
        session.last_cursor = Some("cursor-7".to_string());
        repo.save(session.clone()).await.expect("save");

        let found = repo.find_by_id(&session.id).await.expect("find").expect("exists");
        assert_eq!(found.counters.messages_processed, 7);
        assert_eq!(found.last_cursor.as_deref(), Some("cursor-7"));
        assert_eq!(found.sync_type, SyncType::Initial);

        pool.close().await;
    }

    #[tokio::test]
    async fn in_flight_lookup_sees_pending_and_running_only() {
        let pool = setup_pool().await;
        let repo = SqlSyncSessionRepository::new(pool.clone());

        let mut done = SyncSession::start(account(), SyncType::Incremental);
        done.status = SyncSessionStatus::Completed;
        done.completed_at = Some(Utc::now());
        repo.save(done).await.expect("save completed");

        assert!(repo.find_in_flight_for_account(&account()).await.expect("lookup").is_none());

        let mut running = SyncSession::start(account(), SyncType::Incremental);
        running.status = SyncSessionStatus::Running;
        repo.save(running.clone()).await.expect("save running");

        let found = repo.find_in_flight_for_account(&account()).await.expect("lookup");
        assert_eq!(found.map(|s| s.id), Some(running.id));

        pool.close().await;
    }

    #[tokio::test]
    async fn last_completed_ignores_failed_sessions() {
        let pool = setup_pool().await;
        let repo = SqlSyncSessionRepository::new(pool.clone());

        let mut completed = SyncSession::start(account(), SyncType::Incremental);
        completed.status = SyncSessionStatus::Completed;
        completed.completed_at = Some(Utc::now() - Duration::hours(2));
        completed.last_cursor = Some("cursor-old".to_string());
        repo.save(completed.clone()).await.expect("save completed");

        // A newer failed session must not become the resume point.
        let mut failed = SyncSession::start(account(), SyncType::Incremental);
        failed.status = SyncSessionStatus::Failed;
        failed.completed_at = Some(Utc::now());
        failed.last_cursor = Some("cursor-poisoned".to_string());
        repo.save(failed).await.expect("save failed");

        let found = repo.last_completed_for_account(&account()).await.expect("lookup");
        assert_eq!(found.map(|s| s.last_cursor), Some(Some("cursor-old".to_string())));

        pool.close().await;
    }
}
