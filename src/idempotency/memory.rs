use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus};
use crate::idempotency::store::{InsertOutcome, RecordStore};

/// Volatile record store kept in process memory.
///
/// Every operation takes the same lock for the duration of the map access
/// only. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<InsertOutcome> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.key) {
            return Ok(InsertOutcome::Conflict);
        }
        records.insert(record.key.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(&record.key) {
            Some(existing) => {
                existing.status = record.status;
                existing.response_payload = record.response_payload.clone();
                existing.status_code = record.status_code;
                existing.content_type = record.content_type.clone();
                existing.last_accessed_at = record.last_accessed_at;
                existing.error_message = record.error_message.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(key) {
            Some(existing) => {
                existing.last_accessed_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.records.lock().await.remove(key).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_reapable_at(now));
        Ok((before - records.len()) as u64)
    }

    async fn count_by_status(&self, status: IdempotencyStatus) -> Result<i64> {
        let records = self.records.lock().await;
        Ok(records.values().filter(|r| r.status == status).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::record::RequestContext;
    use chrono::Duration;
    use std::sync::Arc;

    fn record(key: &str) -> IdempotencyRecord {
        IdempotencyRecord::in_progress(key, &RequestContext::new(), Duration::hours(24))
    }

    #[tokio::test]
    async fn test_insert_if_absent_conflicts_on_duplicate() {
        let store = InMemoryRecordStore::new();
        assert_eq!(
            store.insert_if_absent(&record("k")).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&record("k")).await.unwrap(),
            InsertOutcome::Conflict
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert_if_absent(&record("race")).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_update_keeps_identity_fields() {
        let store = InMemoryRecordStore::new();
        let original = record("k");
        store.insert_if_absent(&original).await.unwrap();

        let mut changed = original.clone();
        changed.set_response(b"ok".to_vec(), 201, "text/plain");
        changed.created_at = original.created_at - Duration::days(3);
        assert!(store.update(&changed).await.unwrap());

        let stored = store.find("k").await.unwrap().unwrap();
        assert_eq!(stored.status, IdempotencyStatus::Completed);
        assert_eq!(stored.response_payload.as_deref(), Some(&b"ok"[..]));
        assert_eq!(stored.created_at, original.created_at);

        assert!(!store.update(&record("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_expired_only_removes_expired() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();

        let mut old = record("old");
        old.expires_at = now - Duration::minutes(1);
        let mut marked = record("marked");
        marked.status = IdempotencyStatus::Expired;

        store.insert_if_absent(&old).await.unwrap();
        store.insert_if_absent(&marked).await.unwrap();
        store.insert_if_absent(&record("live")).await.unwrap();

        assert_eq!(store.delete_expired(now).await.unwrap(), 2);
        assert!(store.find("live").await.unwrap().is_some());
        assert_eq!(store.delete_expired(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_touch_and_count() {
        let store = InMemoryRecordStore::new();
        store.insert_if_absent(&record("a")).await.unwrap();
        store.insert_if_absent(&record("b")).await.unwrap();

        let at = Utc::now();
        assert!(store.touch("a", at).await.unwrap());
        assert!(!store.touch("zzz", at).await.unwrap());
        assert_eq!(
            store.find("a").await.unwrap().unwrap().last_accessed_at,
            Some(at)
        );
        assert_eq!(
            store.count_by_status(IdempotencyStatus::InProgress).await.unwrap(),
            2
        );
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
    }
}
