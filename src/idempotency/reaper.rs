use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::idempotency::record::IdempotencyStatus;
use crate::idempotency::store::RecordStore;
use crate::observability::get_metrics;

/// Physically removes records past their time-to-live.
#[derive(Clone)]
pub struct ExpiryReaper {
    store: Arc<dyn RecordStore>,
}

impl ExpiryReaper {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Deletes expired records and returns how many were removed. Errors are
    /// logged and count as zero.
    pub async fn cleanup_expired(&self) -> u64 {
        match self.sweep().await {
            Ok(count) => count,
            Err(e) => {
                get_metrics().record_storage_failure("cleanup_expired");
                tracing::error!(error = %e, "Error cleaning up expired idempotency records");
                0
            }
        }
    }

    /// One sweep with errors surfaced.
    pub async fn sweep(&self) -> Result<u64> {
        let removed = self.store.delete_expired(Utc::now()).await?;
        if removed > 0 {
            get_metrics().record_reaped(removed);
            tracing::info!(removed, "Cleaned up expired idempotency records");
        }

        match self.store.count_by_status(IdempotencyStatus::InProgress).await {
            Ok(in_progress) => get_metrics().set_in_progress_records(in_progress),
            Err(e) => {
                get_metrics().record_storage_failure("count_in_progress");
                tracing::warn!(error = %e, "Could not count in-progress idempotency records");
            }
        }

        Ok(removed)
    }
}

/// Background task running the reaper on a fixed interval.
pub struct IdempotencyCleanupJob {
    reaper: ExpiryReaper,
    interval: Duration,
}

impl IdempotencyCleanupJob {
    pub fn new(reaper: ExpiryReaper, interval_seconds: u64) -> Self {
        Self {
            reaper,
            interval: Duration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Runs the cleanup once.
    pub async fn run_once(&self) -> u64 {
        self.reaper.cleanup_expired().await
    }

    /// Spawns the loop. It stops when `shutdown` flips to `true` or its
    /// sender is dropped. The first sweep happens one interval after start.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_seconds = self.interval.as_secs(), "Idempotency cleanup job started");

            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + self.interval,
                self.interval,
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracing::debug!("Running idempotency cleanup job");
                        self.reaper.cleanup_expired().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Idempotency cleanup job stopped");
        })
    }
}
