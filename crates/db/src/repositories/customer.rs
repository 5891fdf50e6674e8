use sqlx::{sqlite::SqliteRow, Row};

use threadline_core::domain::customer::{Customer, CustomerId};

use super::{parse_timestamp, CustomerRepository, RepositoryError};
use crate::DbPool;

const CUSTOMER_COLUMNS: &str = "id,
                first_name,
                last_name,
                email,
                primary_phone,
                alternate_phone,
                active,
                created_at,
                updated_at";

pub struct SqlCustomerRepository {
    pool: DbPool,
}

impl SqlCustomerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CustomerRepository for SqlCustomerRepository {
    async fn find_by_id(&self, id: &CustomerId) -> Result<Option<Customer>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customer WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(customer_from_row).transpose()
    }

    async fn find_by_primary_phone(
        &self,
        phone: &str,
    ) -> Result<Option<Customer>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customer
             WHERE primary_phone = ? AND active = 1
             ORDER BY created_at ASC
             LIMIT 1"
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;

        row.map(customer_from_row).transpose()
    }

    async fn find_by_alternate_phone(
        &self,
        phone: &str,
    ) -> Result<Option<Customer>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customer
             WHERE alternate_phone = ? AND active = 1
             ORDER BY created_at ASC
             LIMIT 1"
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;

        row.map(customer_from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Customer>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customer WHERE active = 1 ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(customer_from_row).collect()
    }

    async fn save(&self, customer: Customer) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO customer (
                id,
                first_name,
                last_name,
                email,
                primary_phone,
                alternate_phone,
                active,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                email = excluded.email,
                primary_phone = excluded.primary_phone,
                alternate_phone = excluded.alternate_phone,
                active = excluded.active,
                updated_at = excluded.updated_at",
        )
        .bind(&customer.id.0)
        .bind(&customer.first_name)
        .bind(&customer.last_name)
        .bind(customer.email.as_deref())
        .bind(&customer.primary_phone)
        .bind(customer.alternate_phone.as_deref())
        .bind(i64::from(customer.active))
        .bind(customer.created_at.to_rfc3339())
        .bind(customer.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn customer_from_row(row: SqliteRow) -> Result<Customer, RepositoryError> {
    Ok(Customer {
        id: CustomerId(row.try_get("id")?),
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        primary_phone: row.try_get("primary_phone")?,
        alternate_phone: row.try_get("alternate_phone")?,
        active: row.try_get::<i64, _>("active")? != 0,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use threadline_core::domain::customer::{Customer, CustomerId};

    use super::SqlCustomerRepository;
    use crate::migrations;
    use crate::repositories::CustomerRepository;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_customer(phone: &str) -> Customer {
        let now = Utc::now();
        Customer {
            id: CustomerId::generate(),
            first_name: "Jordan".to_string(),
            last_name: "Reyes".to_string(),
            email: Some("jordan@example.com".to_string()),
            primary_phone: phone.to_string(),
            alternate_phone: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let pool = setup_pool().await;
        let repo = SqlCustomerRepository::new(pool.clone());
        let customer = sample_customer("+15551230001");

        repo.save(customer.clone()).await.expect("save");

        let by_id = repo.find_by_id(&customer.id).await.expect("find by id");
        assert_eq!(by_id.as_ref().map(|c| &c.id), Some(&customer.id));

        let by_phone =
            repo.find_by_primary_phone("+15551230001").await.expect("find by primary phone");
        assert_eq!(by_phone.map(|c| c.id), Some(customer.id));

        pool.close().await;
    }

    #[tokio::test]
    async fn alternate_phone_lookup_only_matches_alternate_column() {
        let pool = setup_pool().await;
        let repo = SqlCustomerRepository::new(pool.clone());

        let mut customer = sample_customer("+15551230002");
        customer.alternate_phone = Some("+15551239999".to_string());
        repo.save(customer.clone()).await.expect("save");

        let miss = repo.find_by_alternate_phone("+15551230002").await.expect("lookup");
        assert!(miss.is_none());

        let hit = repo.find_by_alternate_phone("+15551239999").await.expect("lookup");
        assert_eq!(hit.map(|c| c.id), Some(customer.id));

        pool.close().await;
    }

    #[tokio::test]
    async fn inactive_customers_are_excluded_from_phone_lookups() {
        let pool = setup_pool().await;
        let repo = SqlCustomerRepository::new(pool.clone());

        let mut customer = sample_customer("+15551230003");
        customer.active = false;
        repo.save(customer).await.expect("save");

        let found = repo.find_by_primary_phone("+15551230003").await.expect("lookup");
        assert!(found.is_none());
        assert!(repo.list_active().await.expect("list").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let pool = setup_pool().await;
        let repo = SqlCustomerRepository::new(pool.clone());

        let mut customer = sample_customer("+15551230004");
        repo.save(customer.clone()).await.expect("insert");

        customer.last_name = "Reyes-Ortiz".to_string();
        repo.save(customer.clone()).await.expect("update");

        let found = repo.find_by_id(&customer.id).await.expect("find").expect("exists");
        assert_eq!(found.last_name, "Reyes-Ortiz");

        pool.close().await;
    }
}
