use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus};

/// Result of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same key already exists.
    Conflict,
}

/// Persistence primitive for idempotency records.
///
/// Implementations must make `insert_if_absent` atomic per key: of any number
/// of concurrent inserts for one key, exactly one observes `Inserted`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<InsertOutcome>;

    /// Replaces the mutable fields of the stored record with the same key.
    /// Returns `false` when no such record exists.
    async fn update(&self, record: &IdempotencyRecord) -> Result<bool>;

    /// Refreshes `last_accessed_at` without touching anything else.
    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Removes every record with `expires_at < now` or status `Expired`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn count_by_status(&self, status: IdempotencyStatus) -> Result<i64>;
}
