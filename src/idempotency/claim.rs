use std::sync::Arc;

use chrono::Duration;

use crate::error::Result;
use crate::idempotency::record::{IdempotencyRecord, IdempotencyStatus, RequestContext};
use crate::idempotency::store::{InsertOutcome, RecordStore};
use crate::observability::{get_metrics, mask_key};

/// Typed result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the key.
    Claimed,
    /// Another execution holds the key.
    InFlight,
    /// The key already has a cached response.
    AlreadyCompleted,
    /// Another caller inserted the record between our read and our insert.
    LostRace,
    /// The record is in a state that does not admit a new claim.
    Blocked(IdempotencyStatus),
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }

    fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed => "claimed",
            ClaimOutcome::InFlight => "in_flight",
            ClaimOutcome::AlreadyCompleted => "completed",
            ClaimOutcome::LostRace => "lost_race",
            ClaimOutcome::Blocked(_) => "blocked",
        }
    }
}

/// Lets exactly one caller own a key at a time.
#[derive(Clone)]
pub struct KeyClaimProtocol {
    store: Arc<dyn RecordStore>,
    ttl: Duration,
}

impl KeyClaimProtocol {
    pub fn new(store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Attempts to take ownership of `key`. Storage errors are logged and
    /// reported as `false`.
    pub async fn try_claim(&self, key: &str, context: &RequestContext) -> bool {
        if key.is_empty() {
            tracing::warn!("Refusing to claim an empty idempotency key");
            return false;
        }

        match self.claim(key, context).await {
            Ok(outcome) => outcome.is_claimed(),
            Err(e) => {
                get_metrics().record_storage_failure("claim");
                tracing::error!(key = %mask_key(key), error = %e, "Error claiming idempotency key");
                false
            }
        }
    }

    /// Same decision as [`try_claim`](Self::try_claim) but keeps the reason
    /// and surfaces storage errors.
    pub async fn claim(&self, key: &str, context: &RequestContext) -> Result<ClaimOutcome> {
        let outcome = match self.store.find(key).await? {
            Some(existing) => match existing.status {
                IdempotencyStatus::InProgress => {
                    tracing::warn!(key = %mask_key(key), "Key is already in progress");
                    ClaimOutcome::InFlight
                }
                IdempotencyStatus::Completed => {
                    tracing::info!(key = %mask_key(key), "Key already completed");
                    ClaimOutcome::AlreadyCompleted
                }
                status => {
                    tracing::warn!(
                        key = %mask_key(key),
                        status = status.as_str(),
                        "Key exists with a status that blocks a new claim"
                    );
                    ClaimOutcome::Blocked(status)
                }
            },
            None => {
                let record = IdempotencyRecord::in_progress(key, context, self.ttl);
                match self.store.insert_if_absent(&record).await? {
                    InsertOutcome::Inserted => {
                        tracing::info!(key = %mask_key(key), "Marked key as in progress");
                        ClaimOutcome::Claimed
                    }
                    InsertOutcome::Conflict => {
                        tracing::warn!(key = %mask_key(key), "Concurrent request detected for key");
                        ClaimOutcome::LostRace
                    }
                }
            }
        };

        get_metrics().record_claim(outcome.label());
        Ok(outcome)
    }
}
