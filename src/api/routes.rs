use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use super::handlers;
use crate::idempotency::IdempotencyHandler;
use crate::observability::HealthChecker;
use crate::transaction::{RetryPolicy, TransactionCoordinator, TransactionalStore};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub idempotency: IdempotencyHandler,
    pub health_checker: Arc<HealthChecker>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub retry_policy: RetryPolicy,
}

impl AppState {
    pub fn new(idempotency: IdempotencyHandler, health_checker: Arc<HealthChecker>) -> Self {
        Self {
            idempotency,
            health_checker,
            metrics_handle: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// A coordinator for one protected request, retrying with the
    /// configured policy.
    pub fn coordinator<S: TransactionalStore>(&self, store: Arc<S>) -> TransactionCoordinator<S> {
        TransactionCoordinator::new(store, self.retry_policy.clone())
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        // Idempotency endpoints
        .route("/idempotency/cleanup", post(handlers::trigger_cleanup))
        .route("/idempotency/:key", get(handlers::get_idempotency_status))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::{IdempotencyHandlerConfig, InMemoryRecordStore};
    use crate::transaction::{PgTransactionalStore, RetryStrategy};
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn test_coordinator_uses_configured_retry_policy() {
        let store = Arc::new(InMemoryRecordStore::new());
        let handler = IdempotencyHandler::new(store.clone(), IdempotencyHandlerConfig::default());
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 10,
        };
        let state = AppState::new(handler, Arc::new(HealthChecker::new(None, store)))
            .with_retry_policy(policy.clone());
        assert_eq!(state.retry_policy, policy);

        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let coordinator = state.coordinator(Arc::new(PgTransactionalStore::new(pool)));
        assert!(!coordinator.is_active());
    }
}
