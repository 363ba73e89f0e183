use crate::error::{AppError, Result};
use crate::idempotency::claim::{ClaimOutcome, KeyClaimProtocol};
use crate::idempotency::key::validate_key;
use crate::idempotency::reaper::ExpiryReaper;
use crate::idempotency::record::{RequestContext, DEFAULT_TTL_SECONDS};
use crate::idempotency::response_cache::{CachedResponse, ResponseCache, ResponseLookup};
use crate::idempotency::store::RecordStore;
use crate::observability::{get_metrics, mask_key, LatencyTimer};
use crate::transaction::{TransactionCoordinator, TransactionalStore, TxFuture};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub duplicate_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub unguarded_requests: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unguarded(&self) {
        self.unguarded_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_rate(&self) -> f64 {
        self.snapshot().duplicate_rate()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            unguarded_requests: self.unguarded_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub duplicate_requests: u64,
    pub new_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub unguarded_requests: u64,
}

impl MetricsSnapshot {
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.duplicate_requests as f64 / self.total_requests as f64
        }
    }
}

/// What `execute` did for a request.
#[derive(Debug)]
pub enum Execution<T> {
    /// The operation ran and committed; its result has been cached.
    Executed(T),
    /// A previous execution's stored response, returned unchanged.
    Replayed(CachedResponse),
}

impl<T> Execution<T> {
    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }
}

/// Configuration for the idempotency handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyHandlerConfig {
    pub ttl_seconds: i64,
}

impl Default for IdempotencyHandlerConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }
}

/// Runs a write operation at most once per idempotency key.
///
/// One handler is shared by all requests; each request brings its own
/// [`TransactionCoordinator`].
#[derive(Clone)]
pub struct IdempotencyHandler {
    claims: KeyClaimProtocol,
    cache: ResponseCache,
    reaper: ExpiryReaper,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyHandler {
    pub fn new(store: Arc<dyn RecordStore>, config: IdempotencyHandlerConfig) -> Self {
        let ttl = chrono::Duration::seconds(config.ttl_seconds);
        Self {
            claims: KeyClaimProtocol::new(Arc::clone(&store), ttl),
            cache: ResponseCache::new(Arc::clone(&store), ttl),
            reaper: ExpiryReaper::new(store),
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    /// Gets the metrics for this handler.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn claims(&self) -> &KeyClaimProtocol {
        &self.claims
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn reaper(&self) -> &ExpiryReaper {
        &self.reaper
    }

    /// Replays the stored response for `key`, or claims it and runs
    /// `operation` in a transaction.
    ///
    /// A successful result is JSON-encoded and cached under `status_code`.
    /// A failed operation marks the key failed and its error is returned.
    /// Storage faults in the idempotency layer do not block the operation.
    /// A coordinator with a manual transaction open is rejected before the
    /// key is claimed.
    pub async fn execute<S, T, F>(
        &self,
        key: &str,
        context: &RequestContext,
        status_code: u16,
        coordinator: &mut TransactionCoordinator<S>,
        operation: F,
    ) -> Result<Execution<T>>
    where
        S: TransactionalStore,
        T: Serialize + Send,
        F: for<'t> FnMut(&'t mut S::Tx) -> TxFuture<'t, T> + Send,
    {
        validate_key(key)?;
        // Refuse before claiming so the key is left untouched.
        if coordinator.is_active() {
            return Err(AppError::TransactionAlreadyActive);
        }
        self.metrics.record_request();

        if let Some(replay) = self.replay_or_reject(key).await? {
            return Ok(Execution::Replayed(replay));
        }

        match self.claims.claim(key, context).await {
            Ok(ClaimOutcome::Claimed) => self.metrics.record_new(),
            Ok(ClaimOutcome::AlreadyCompleted) => {
                // Completed between our lookup and our claim.
                if let Some(replay) = self.replay_or_reject(key).await? {
                    return Ok(Execution::Replayed(replay));
                }
                self.metrics.record_duplicate();
                return Err(AppError::Conflict(format!(
                    "Idempotency key {} has no replayable response",
                    mask_key(key)
                )));
            }
            Ok(ClaimOutcome::InFlight) | Ok(ClaimOutcome::LostRace) => {
                self.metrics.record_duplicate();
                return Err(AppError::Conflict(format!(
                    "Request with idempotency key {} is already being processed",
                    mask_key(key)
                )));
            }
            Ok(ClaimOutcome::Blocked(status)) => {
                self.metrics.record_duplicate();
                return Err(AppError::Conflict(format!(
                    "Idempotency key {} is {} and cannot be reused until it expires",
                    mask_key(key),
                    status.as_str()
                )));
            }
            Err(e) => {
                self.metrics.record_unguarded();
                tracing::warn!(
                    key = %mask_key(key),
                    error = %e,
                    "Idempotency store unavailable; proceeding without a claim"
                );
            }
        }

        let timer = LatencyTimer::new();
        match coordinator.execute_in_transaction(operation).await {
            Ok(value) => {
                get_metrics().record_operation_latency(timer.elapsed_ms(), "committed");
                if !self.cache.try_save_json(key, &value, status_code, context).await {
                    tracing::warn!(key = %mask_key(key), "Response committed but not cached");
                }
                self.metrics.record_completed();
                Ok(Execution::Executed(value))
            }
            Err(e) => {
                get_metrics().record_operation_latency(timer.elapsed_ms(), "failed");
                self.cache.mark_failed(key, &e.to_string()).await;
                self.metrics.record_failed();
                Err(e)
            }
        }
    }

    /// `Some` for a replayable response, `Err(Conflict)` while another
    /// execution holds the key, `None` when nothing is stored.
    async fn replay_or_reject(&self, key: &str) -> Result<Option<CachedResponse>> {
        match self.cache.try_get_response(key).await {
            ResponseLookup::Replay(response) => {
                self.metrics.record_duplicate();
                tracing::info!(key = %mask_key(key), "Replaying stored response");
                Ok(Some(response))
            }
            ResponseLookup::InFlight => {
                self.metrics.record_duplicate();
                Err(AppError::Conflict(format!(
                    "Request with idempotency key {} is already being processed",
                    mask_key(key)
                )))
            }
            ResponseLookup::NotFound => Ok(None),
        }
    }

    /// Runs cleanup of expired idempotency records.
    pub async fn cleanup_expired(&self) -> u64 {
        self.reaper.cleanup_expired().await
    }
}
