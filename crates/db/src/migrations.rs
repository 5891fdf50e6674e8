use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::connect_with_settings;

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "customer",
        "phone_mapping",
        "conversation",
        "message",
        "external_id_mapping",
        "sync_session",
        "idx_customer_primary_phone",
        "idx_customer_alternate_phone",
        "idx_customer_active",
        "idx_phone_mapping_customer_id",
        "idx_conversation_key",
        "idx_conversation_status",
        "idx_conversation_last_message_at",
        "idx_message_conversation_id",
        "idx_message_sent_at",
        "idx_external_id_mapping_message_id",
        "idx_sync_session_account_status",
        "idx_sync_session_started_at",
    ];

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in ["customer", "conversation", "message", "external_id_mapping", "sync_session"]
        {
            let count = sqlx::query(
                "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("check table")
            .get::<i64, _>("count");

            assert_eq!(count, 1, "expected table `{table}` to exist");
        }

        pool.close().await;
    }

    #[tokio::test]
    async fn migrations_only_create_managed_objects() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let rows = sqlx::query(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'index') \
               AND name NOT LIKE 'sqlite_%' \
               AND name NOT LIKE '_sqlx_%'",
        )
        .fetch_all(&pool)
        .await
        .expect("list schema objects");

        for row in rows {
            let name: String = row.get("name");
            assert!(
                MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()),
                "unexpected schema object `{name}`"
            );
        }

        pool.close().await;
    }

    #[tokio::test]
    async fn migrations_are_idempotent_under_rerun() {
        let pool =
            connect_with_settings("sqlite::memory:?cache=shared", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("first run");
        run_pending(&pool).await.expect("second run");

        pool.close().await;
    }
}
