use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use threadline_core::domain::conversation::{
    Conversation, ConversationId, ConversationKey, ConversationPriority, ConversationStatus,
};
use threadline_core::domain::customer::CustomerId;

use super::{parse_timestamp, ConversationRepository, RepositoryError};
use crate::DbPool;

const CONVERSATION_COLUMNS: &str = "id,
                customer_id,
                phone_number,
                platform,
                status,
                priority,
                last_message_at,
                external_thread_id,
                created_at,
                updated_at";

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn find_active_for_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation
             WHERE customer_id = ? AND phone_number = ? AND platform = ? AND status = 'active'
             ORDER BY updated_at DESC
             LIMIT 1"
        ))
        .bind(&key.customer_id.0)
        .bind(&key.phone_number)
        .bind(&key.platform)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn find_recent_resolved_for_key(
        &self,
        key: &ConversationKey,
        since: DateTime<Utc>,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation
             WHERE customer_id = ? AND phone_number = ? AND platform = ?
               AND status = 'resolved' AND last_message_at >= ?
             ORDER BY last_message_at DESC
             LIMIT 1"
        ))
        .bind(&key.customer_id.0)
        .bind(&key.phone_number)
        .bind(&key.platform)
        .bind(since.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn list_open_for_key(
        &self,
        key: &ConversationKey,
        created_since: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation
             WHERE customer_id = ? AND phone_number = ? AND platform = ?
               AND status != 'archived' AND created_at >= ?
             ORDER BY updated_at DESC"
        ))
        .bind(&key.customer_id.0)
        .bind(&key.phone_number)
        .bind(&key.platform)
        .bind(created_since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(conversation_from_row).collect()
    }

    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation (
                id,
                customer_id,
                phone_number,
                platform,
                status,
                priority,
                last_message_at,
                external_thread_id,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                customer_id = excluded.customer_id,
                phone_number = excluded.phone_number,
                platform = excluded.platform,
                status = excluded.status,
                priority = excluded.priority,
                last_message_at = excluded.last_message_at,
                external_thread_id = excluded.external_thread_id,
                updated_at = excluded.updated_at",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.customer_id.0)
        .bind(&conversation.phone_number)
        .bind(&conversation.platform)
        .bind(conversation.status.as_str())
        .bind(conversation.priority.as_str())
        .bind(conversation.last_message_at.to_rfc3339())
        .bind(conversation.external_thread_id.as_deref())
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn conversation_from_row(row: SqliteRow) -> Result<Conversation, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ConversationStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown conversation status `{status_raw}`"))
    })?;

    let priority_raw = row.try_get::<String, _>("priority")?;
    let priority = ConversationPriority::parse(&priority_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown conversation priority `{priority_raw}`"))
    })?;

    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        customer_id: CustomerId(row.try_get("customer_id")?),
        phone_number: row.try_get("phone_number")?,
        platform: row.try_get("platform")?,
        status,
        priority,
        last_message_at: parse_timestamp("last_message_at", row.try_get("last_message_at")?)?,
        external_thread_id: row.try_get("external_thread_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use threadline_core::domain::conversation::{
        Conversation, ConversationId, ConversationKey, ConversationPriority, ConversationStatus,
    };
    use threadline_core::domain::customer::{Customer, CustomerId};

    use super::SqlConversationRepository;
    use crate::migrations;
    use crate::repositories::{ConversationRepository, CustomerRepository, SqlCustomerRepository};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn insert_customer(pool: &DbPool, phone: &str) -> CustomerId {
        let now = Utc::now();
        let customer = Customer {
            id: CustomerId::generate(),
            first_name: "Casey".to_string(),
            last_name: "Moreno".to_string(),
            email: None,
            primary_phone: phone.to_string(),
            alternate_phone: None,
            active: true,
            created_at: now,
            updated_at: now,
        };
        let id = customer.id.clone();
        SqlCustomerRepository::new(pool.clone()).save(customer).await.expect("save customer");
        id
    }

    fn sample_conversation(
        customer_id: &CustomerId,
        phone: &str,
        status: ConversationStatus,
    ) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: ConversationId::generate(),
            customer_id: customer_id.clone(),
            phone_number: phone.to_string(),
            platform: "sms".to_string(),
            status,
            priority: ConversationPriority::Medium,
            last_message_at: now,
            external_thread_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn active_lookup_matches_full_key() {
        let pool = setup_pool().await;
        let customer_id = insert_customer(&pool, "+15551240001").await;
        let repo = SqlConversationRepository::new(pool.clone());

        let conversation =
            sample_conversation(&customer_id, "+15551240001", ConversationStatus::Active);
        repo.save(conversation.clone()).await.expect("save");

        let key = conversation.key();
        let found = repo.find_active_for_key(&key).await.expect("lookup");
        assert_eq!(found.map(|c| c.id), Some(conversation.id));

        let other_platform = ConversationKey { platform: "voice".to_string(), ..key };
        let miss = repo.find_active_for_key(&other_platform).await.expect("lookup");
        assert!(miss.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn recent_resolved_lookup_honors_cutoff() {
        let pool = setup_pool().await;
        let customer_id = insert_customer(&pool, "+15551240002").await;
        let repo = SqlConversationRepository::new(pool.clone());

        let mut conversation =
            sample_conversation(&customer_id, "+15551240002", ConversationStatus::Resolved);
        conversation.last_message_at = Utc::now() - Duration::hours(30);
        repo.save(conversation.clone()).await.expect("save");

        let key = conversation.key();
        let cutoff = Utc::now() - Duration::hours(24);
        let stale = repo.find_recent_resolved_for_key(&key, cutoff).await.expect("lookup");
        assert!(stale.is_none());

        let wide_cutoff = Utc::now() - Duration::hours(48);
        let hit = repo.find_recent_resolved_for_key(&key, wide_cutoff).await.expect("lookup");
        assert_eq!(hit.map(|c| c.id), Some(conversation.id));

        pool.close().await;
    }

    #[tokio::test]
    async fn open_listing_excludes_archived_and_orders_by_recency() {
        let pool = setup_pool().await;
        let customer_id = insert_customer(&pool, "+15551240003").await;
        let repo = SqlConversationRepository::new(pool.clone());

        let mut older =
            sample_conversation(&customer_id, "+15551240003", ConversationStatus::Active);
        older.updated_at = Utc::now() - Duration::hours(2);
        let newer =
            sample_conversation(&customer_id, "+15551240003", ConversationStatus::Resolved);
        let archived =
            sample_conversation(&customer_id, "+15551240003", ConversationStatus::Archived);

        repo.save(older.clone()).await.expect("save older");
        repo.save(newer.clone()).await.expect("save newer");
        repo.save(archived).await.expect("save archived");

        let key = newer.key();
        let listed = repo
            .list_open_for_key(&key, Utc::now() - Duration::days(7))
            .await
            .expect("list open");

        let ids: Vec<_> = listed.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        pool.close().await;
    }
}
