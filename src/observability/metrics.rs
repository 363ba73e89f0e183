use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppError, Result};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency and transaction layers.
///
/// Recording is a no-op until a recorder is installed with [`init_metrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_claim(&self, outcome: &'static str) {
        counter!("idempotency_claims_total", "outcome" => outcome).increment(1);
    }

    pub fn record_lookup(&self, outcome: &'static str) {
        counter!("idempotency_lookups_total", "outcome" => outcome).increment(1);
    }

    pub fn record_response_saved(&self, status_code: u16) {
        counter!("idempotency_responses_saved_total", "status" => status_code.to_string()).increment(1);
    }

    pub fn record_marked_failed(&self) {
        counter!("idempotency_marked_failed_total").increment(1);
    }

    pub fn record_storage_failure(&self, operation: &'static str) {
        counter!("idempotency_storage_failures_total", "operation" => operation).increment(1);
    }

    pub fn record_reaped(&self, count: u64) {
        counter!("idempotency_records_reaped_total").increment(count);
    }

    pub fn set_in_progress_records(&self, count: i64) {
        gauge!("idempotency_in_progress_records").set(count as f64);
    }

    pub fn record_transaction_committed(&self, attempts: u32) {
        counter!("transactions_committed_total").increment(1);
        histogram!("transaction_attempts").record(attempts as f64);
    }

    pub fn record_transaction_rolled_back(&self) {
        counter!("transactions_rolled_back_total").increment(1);
    }

    pub fn record_transaction_retry(&self) {
        counter!("transaction_retries_total").increment(1);
    }

    pub fn record_operation_latency(&self, duration_ms: f64, outcome: &'static str) {
        histogram!("idempotent_operation_duration_ms", "outcome" => outcome).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();

    METRICS.get_or_init(Metrics::new);
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_claims_total", Unit::Count, "Key claim attempts by outcome");
    describe_counter!("idempotency_lookups_total", Unit::Count, "Cached response lookups by outcome");
    describe_counter!("idempotency_responses_saved_total", Unit::Count, "Responses persisted against a key");
    describe_counter!("idempotency_marked_failed_total", Unit::Count, "Keys marked as failed");
    describe_counter!("idempotency_storage_failures_total", Unit::Count, "Record store errors absorbed by the fail-open layer");
    describe_counter!("idempotency_records_reaped_total", Unit::Count, "Expired records removed by the reaper");
    describe_gauge!("idempotency_in_progress_records", Unit::Count, "Records currently in progress");

    describe_counter!("transactions_committed_total", Unit::Count, "Transactions committed");
    describe_counter!("transactions_rolled_back_total", Unit::Count, "Transactions rolled back");
    describe_counter!("transaction_retries_total", Unit::Count, "Transaction retries after transient faults");
    describe_histogram!("transaction_attempts", Unit::Count, "Attempts needed per committed transaction");
    describe_histogram!("idempotent_operation_duration_ms", Unit::Milliseconds, "Idempotent operation latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
