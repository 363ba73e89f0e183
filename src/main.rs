use marketplace_idempotency::api::{create_router, AppState};
use marketplace_idempotency::config::{Settings, StoreBackend};
use marketplace_idempotency::idempotency::{
    IdempotencyCleanupJob, IdempotencyHandler, IdempotencyHandlerConfig, InMemoryRecordStore,
    PostgresRecordStore, RecordStore,
};
use marketplace_idempotency::observability::{
    init_logging, init_metrics, mask_sensitive, HealthChecker, LogConfig,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&LogConfig::from(&settings.application));
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    let (pool, store): (_, Arc<dyn RecordStore>) = match settings.idempotency.backend {
        StoreBackend::Postgres => {
            info!(
                "Connecting to database at {}...",
                mask_sensitive(&settings.database.url, 12)
            );
            let pool = PgPoolOptions::new()
                .max_connections(settings.database.pool_size)
                .acquire_timeout(Duration::from_secs(settings.database.acquire_timeout_seconds))
                .connect(&settings.database.url)
                .await?;
            info!("Database connection established");

            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Migrations applied successfully");

            let store = Arc::new(PostgresRecordStore::new(pool.clone()));
            (Some(pool), store)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory idempotency store; records do not survive restarts");
            (None, Arc::new(InMemoryRecordStore::new()))
        }
    };

    let handler = IdempotencyHandler::new(
        Arc::clone(&store),
        IdempotencyHandlerConfig {
            ttl_seconds: settings.idempotency.ttl_seconds,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = IdempotencyCleanupJob::new(
        handler.reaper().clone(),
        settings.idempotency.cleanup_interval_seconds,
    )
    .start(shutdown_rx);

    let health_checker = Arc::new(HealthChecker::new(pool, store));
    let retry_policy = settings.retry.to_policy();
    info!(
        "Transaction retries: {:?}, up to {} retries",
        retry_policy.strategy, retry_policy.max_retries
    );
    let state = AppState::new(handler, health_checker)
        .with_metrics(metrics_handle)
        .with_retry_policy(retry_policy);

    let app = create_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    cleanup.await?;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
