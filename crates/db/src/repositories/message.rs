use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use threadline_core::domain::conversation::ConversationId;
use threadline_core::domain::customer::{CustomerId, PhoneMapping, SourceAccountId};
use threadline_core::domain::message::{
    ExternalIdMapping, Message, MessageDirection, MessageId,
};

use super::{parse_timestamp, parse_u32, MessageRepository, RepositoryError};
use crate::DbPool;

const MESSAGE_COLUMNS: &str = "id,
                conversation_id,
                direction,
                content,
                sent_at,
                emergency,
                created_at";

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM message WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(message_from_row).transpose()
    }

    async fn find_mapped_message(
        &self,
        external_message_id: &str,
        account_id: &SourceAccountId,
    ) -> Result<Option<MessageId>, RepositoryError> {
        let row = sqlx::query(
            "SELECT message_id FROM external_id_mapping
             WHERE external_message_id = ? AND source_account_id = ?",
        )
        .bind(external_message_id)
        .bind(&account_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.try_get("message_id").map(MessageId)).transpose()?)
    }

    async fn find_content_match(
        &self,
        phone: &str,
        content: &str,
        direction: MessageDirection,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<MessageId>, RepositoryError> {
        let row = sqlx::query(
            "SELECT m.id FROM message m
             JOIN conversation c ON c.id = m.conversation_id
             WHERE c.phone_number = ?
               AND m.content = ?
               AND m.direction = ?
               AND m.sent_at >= ?
               AND m.sent_at <= ?
             ORDER BY m.sent_at ASC
             LIMIT 1",
        )
        .bind(phone)
        .bind(content)
        .bind(direction.as_str())
        .bind(window_start.to_rfc3339())
        .bind(window_end.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.try_get("id").map(MessageId)).transpose()?)
    }

    async fn import(
        &self,
        message: Message,
        mapping: ExternalIdMapping,
        customer_id: &CustomerId,
        phone: &str,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO message (
                id,
                conversation_id,
                direction,
                content,
                sent_at,
                emergency,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id.0)
        .bind(&message.conversation_id.0)
        .bind(message.direction.as_str())
        .bind(&message.content)
        .bind(message.sent_at.to_rfc3339())
        .bind(i64::from(message.emergency))
        .bind(message.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let mapping_insert = sqlx::query(
            "INSERT INTO external_id_mapping (
                external_message_id,
                source_account_id,
                message_id,
                created_at
             ) VALUES (?, ?, ?, ?)",
        )
        .bind(&mapping.external_message_id)
        .bind(&mapping.source_account_id.0)
        .bind(&mapping.message_id.0)
        .bind(mapping.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(error) = mapping_insert {
            let unique_violation = matches!(
                &error,
                sqlx::Error::Database(db_error) if db_error.is_unique_violation()
            );
            if unique_violation {
                return Err(RepositoryError::MappingConflict {
                    external_message_id: mapping.external_message_id.clone(),
                    account_id: mapping.source_account_id.0.clone(),
                });
            }
            return Err(error.into());
        }

        // Count increments on every import after the first contact.
        sqlx::query(
            "INSERT INTO phone_mapping (
                source_account_id,
                phone_number,
                customer_id,
                first_contact_at,
                last_contact_at,
                message_count
             ) VALUES (?, ?, ?, ?, ?, 1)
             ON CONFLICT(source_account_id, phone_number) DO UPDATE SET
                customer_id = excluded.customer_id,
                last_contact_at = excluded.last_contact_at,
                message_count = phone_mapping.message_count + 1",
        )
        .bind(&mapping.source_account_id.0)
        .bind(phone)
        .bind(&customer_id.0)
        .bind(message.sent_at.to_rfc3339())
        .bind(message.sent_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
             WHERE conversation_id = ?
             ORDER BY sent_at ASC"
        ))
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn reassign_conversation(
        &self,
        from: &ConversationId,
        to: &ConversationId,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query("UPDATE message SET conversation_id = ? WHERE conversation_id = ?")
            .bind(&to.0)
            .bind(&from.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn find_phone_mapping(
        &self,
        account_id: &SourceAccountId,
        phone: &str,
    ) -> Result<Option<PhoneMapping>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                source_account_id,
                phone_number,
                customer_id,
                first_contact_at,
                last_contact_at,
                message_count
             FROM phone_mapping
             WHERE source_account_id = ? AND phone_number = ?",
        )
        .bind(&account_id.0)
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;

        row.map(phone_mapping_from_row).transpose()
    }
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let direction_raw = row.try_get::<String, _>("direction")?;
    let direction = MessageDirection::parse(&direction_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown message direction `{direction_raw}`"))
    })?;

    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        direction,
        content: row.try_get("content")?,
        sent_at: parse_timestamp("sent_at", row.try_get("sent_at")?)?,
        emergency: row.try_get::<i64, _>("emergency")? != 0,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn phone_mapping_from_row(row: SqliteRow) -> Result<PhoneMapping, RepositoryError> {
    Ok(PhoneMapping {
        source_account_id: SourceAccountId(row.try_get("source_account_id")?),
        phone_number: row.try_get("phone_number")?,
        customer_id: CustomerId(row.try_get("customer_id")?),
        first_contact_at: parse_timestamp("first_contact_at", row.try_get("first_contact_at")?)?,
        last_contact_at: parse_timestamp("last_contact_at", row.try_get("last_contact_at")?)?,
        message_count: parse_u32("message_count", row.try_get("message_count")?)?,
    })
}
