use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus, RequestContext};
use crate::idempotency::store::{InsertOutcome, RecordStore};
use crate::observability::{get_metrics, mask_key};

/// Status code reported for a key whose execution is still running.
pub const IN_FLIGHT_STATUS: u16 = 409;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A completed outcome, reproduced byte for byte on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub payload: Vec<u8>,
    pub status_code: u16,
    pub content_type: String,
}

impl CachedResponse {
    /// Decodes the payload as JSON into the caller's type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(AppError::Serialization)
    }

    pub fn status(&self) -> http::StatusCode {
        http::StatusCode::from_u16(self.status_code).unwrap_or(http::StatusCode::OK)
    }
}

/// What a duplicate request learns about a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLookup {
    /// The key completed; replay this.
    Replay(CachedResponse),
    /// Another execution holds the key; retry later.
    InFlight,
    /// Unknown, expired, failed, or unreadable.
    NotFound,
}

impl ResponseLookup {
    pub fn found(&self) -> bool {
        matches!(self, ResponseLookup::Replay(_))
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            ResponseLookup::Replay(response) => Some(&response.payload),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ResponseLookup::Replay(response) => Some(response.status_code),
            ResponseLookup::InFlight => Some(IN_FLIGHT_STATUS),
            ResponseLookup::NotFound => None,
        }
    }
}

/// Coarse view of a key for status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyStatus {
    InProgress,
    Completed { status_code: u16 },
    Failed,
    NotFound,
}

/// Persists and replays the final outcome of a key.
///
/// Fail-open: store errors are logged and reported as `false` / `NotFound`.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn RecordStore>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Stores `payload` as the completed outcome of `key`, creating the
    /// record when no claim preceded it and overwriting otherwise.
    pub async fn try_save_response(
        &self,
        key: &str,
        payload: &[u8],
        status_code: u16,
        content_type: &str,
        context: &RequestContext,
    ) -> bool {
        match self
            .save_response(key, payload, status_code, content_type, context)
            .await
        {
            Ok(()) => {
                get_metrics().record_response_saved(status_code);
                tracing::info!(key = %mask_key(key), status_code, "Saved response for key");
                true
            }
            Err(e) => {
                get_metrics().record_storage_failure("save_response");
                tracing::error!(key = %mask_key(key), error = %e, "Error saving response for key");
                false
            }
        }
    }

    /// JSON-encodes `value` and saves it with [`JSON_CONTENT_TYPE`].
    pub async fn try_save_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        status_code: u16,
        context: &RequestContext,
    ) -> bool {
        match serde_json::to_vec(value) {
            Ok(payload) => {
                self.try_save_response(key, &payload, status_code, JSON_CONTENT_TYPE, context)
                    .await
            }
            Err(e) => {
                tracing::error!(key = %mask_key(key), error = %e, "Failed to serialize response");
                false
            }
        }
    }

    async fn save_response(
        &self,
        key: &str,
        payload: &[u8],
        status_code: u16,
        content_type: &str,
        context: &RequestContext,
    ) -> Result<()> {
        if let Some(existing) = self.store.find(key).await? {
            return self
                .overwrite(existing, payload, status_code, content_type)
                .await;
        }

        let record = IdempotencyRecord::completed(
            key,
            payload.to_vec(),
            status_code,
            content_type,
            context,
            self.ttl,
        );
        match self.store.insert_if_absent(&record).await? {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::Conflict => {
                // Someone created the record after our read; fall back to the update path.
                let existing = self.store.find(key).await?.ok_or_else(|| {
                    AppError::Conflict(format!("Record for key vanished while saving: {}", mask_key(key)))
                })?;
                self.overwrite(existing, payload, status_code, content_type)
                    .await
            }
        }
    }

    async fn overwrite(
        &self,
        mut existing: IdempotencyRecord,
        payload: &[u8],
        status_code: u16,
        content_type: &str,
    ) -> Result<()> {
        if existing.is_completed() {
            tracing::warn!(key = %mask_key(&existing.key), "Overwriting an already completed response");
        }

        existing.set_response(payload.to_vec(), status_code, content_type);
        existing.last_accessed_at = Some(Utc::now());

        if self.store.update(&existing).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!(
                "Record for key {} disappeared before update",
                mask_key(&existing.key)
            )))
        }
    }

    /// Looks up the cached outcome of `key`.
    pub async fn try_get_response(&self, key: &str) -> ResponseLookup {
        let lookup = match self.get_response(key).await {
            Ok(lookup) => lookup,
            Err(e) => {
                get_metrics().record_storage_failure("get_response");
                tracing::error!(key = %mask_key(key), error = %e, "Error retrieving response for key");
                ResponseLookup::NotFound
            }
        };

        get_metrics().record_lookup(match lookup {
            ResponseLookup::Replay(_) => "replay",
            ResponseLookup::InFlight => "in_flight",
            ResponseLookup::NotFound => "not_found",
        });
        lookup
    }

    async fn get_response(&self, key: &str) -> Result<ResponseLookup> {
        let now = Utc::now();
        let record = match self.store.find(key).await? {
            Some(record) => record,
            None => {
                tracing::debug!(key = %mask_key(key), "Key not found");
                return Ok(ResponseLookup::NotFound);
            }
        };

        if record.is_expired_at(now) {
            tracing::info!(key = %mask_key(key), "Key expired");
            return Ok(ResponseLookup::NotFound);
        }

        match record.status {
            IdempotencyStatus::InProgress => {
                tracing::warn!(key = %mask_key(key), "Key is currently being processed");
                return Ok(ResponseLookup::InFlight);
            }
            IdempotencyStatus::Failed => {
                tracing::warn!(
                    key = %mask_key(key),
                    error = record.error_message.as_deref().unwrap_or(""),
                    "Key processing failed previously"
                );
                return Ok(ResponseLookup::NotFound);
            }
            IdempotencyStatus::Completed => {}
            status => {
                tracing::warn!(key = %mask_key(key), status = status.as_str(), "Key has unexpected status");
                return Ok(ResponseLookup::NotFound);
            }
        }

        let payload = match record.response_payload {
            Some(payload) if !payload.is_empty() => payload,
            _ => {
                tracing::warn!(key = %mask_key(key), "Key found but response is empty");
                return Ok(ResponseLookup::NotFound);
            }
        };

        self.store.touch(key, now).await?;

        let status_code = record
            .status_code
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(200);
        tracing::info!(key = %mask_key(key), status_code, "Retrieved cached response for key");

        Ok(ResponseLookup::Replay(CachedResponse {
            payload,
            status_code,
            content_type: record
                .content_type
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_string()),
        }))
    }

    /// Moves `key` to `Failed`. Unknown keys are ignored.
    pub async fn mark_failed(&self, key: &str, error_message: &str) {
        match self.set_failed(key, error_message).await {
            Ok(true) => {
                get_metrics().record_marked_failed();
                tracing::info!(key = %mask_key(key), error = error_message, "Marked key as failed");
            }
            Ok(false) => {
                tracing::debug!(key = %mask_key(key), "Ignoring failure for unknown key");
            }
            Err(e) => {
                get_metrics().record_storage_failure("mark_failed");
                tracing::error!(key = %mask_key(key), error = %e, "Error marking key as failed");
            }
        }
    }

    async fn set_failed(&self, key: &str, error_message: &str) -> Result<bool> {
        match self.store.find(key).await? {
            Some(mut record) => {
                record.set_failed(error_message);
                record.last_accessed_at = Some(Utc::now());
                self.store.update(&record).await
            }
            None => Ok(false),
        }
    }

    /// Whether `key` is currently held by a running execution.
    pub async fn is_in_progress(&self, key: &str) -> bool {
        matches!(self.lookup_status(key).await, KeyStatus::InProgress)
    }

    pub async fn lookup_status(&self, key: &str) -> KeyStatus {
        let record = match self.store.find(key).await {
            Ok(Some(record)) if !record.is_expired() => record,
            Ok(_) => return KeyStatus::NotFound,
            Err(e) => {
                get_metrics().record_storage_failure("lookup_status");
                tracing::error!(key = %mask_key(key), error = %e, "Error looking up key status");
                return KeyStatus::NotFound;
            }
        };

        match record.status {
            IdempotencyStatus::InProgress => KeyStatus::InProgress,
            IdempotencyStatus::Completed => KeyStatus::Completed {
                status_code: record
                    .status_code
                    .and_then(|code| u16::try_from(code).ok())
                    .unwrap_or(200),
            },
            IdempotencyStatus::Failed => KeyStatus::Failed,
            _ => KeyStatus::NotFound,
        }
    }
}
