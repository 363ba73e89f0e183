use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{AppError, Result};
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus};
use crate::idempotency::store::{InsertOutcome, RecordStore};

/// Durable record store backed by the `idempotency_records` table.
///
/// The primary key on `key` is what makes "first writer wins" hold across
/// processes.
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT key, status, response_payload, status_code, content_type, created_at, last_accessed_at, expires_at, principal, endpoint, method, error_message
            FROM idempotency_records
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(record)
    }

    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<InsertOutcome> {
        // No returned row means the key constraint rejected the insert.
        let inserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO idempotency_records (key, status, response_payload, status_code, content_type, created_at, last_accessed_at, expires_at, principal, endpoint, method, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (key) DO NOTHING
            RETURNING key
            "#,
        )
        .bind(&record.key)
        .bind(record.status)
        .bind(&record.response_payload)
        .bind(record.status_code)
        .bind(&record.content_type)
        .bind(record.created_at)
        .bind(record.last_accessed_at)
        .bind(record.expires_at)
        .bind(&record.principal)
        .bind(&record.endpoint)
        .bind(&record.method)
        .bind(&record.error_message)
        .fetch_optional(&self.pool)
        .await;

        match inserted {
            Ok(Some(_)) => Ok(InsertOutcome::Inserted),
            Ok(None) => Ok(InsertOutcome::Conflict),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(InsertOutcome::Conflict)
            }
            Err(e) => Err(AppError::Database(e)),
        }
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = $2, response_payload = $3, status_code = $4, content_type = $5, last_accessed_at = $6, error_message = $7
            WHERE key = $1
            "#,
        )
        .bind(&record.key)
        .bind(record.status)
        .bind(&record.response_payload)
        .bind(record.status_code)
        .bind(&record.content_type)
        .bind(record.last_accessed_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET last_accessed_at = $2
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE expires_at < $1 OR status = $2
            "#,
        )
        .bind(now)
        .bind(IdempotencyStatus::Expired)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: IdempotencyStatus) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_records WHERE status = $1
            "#,
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }
}
