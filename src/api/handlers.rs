use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::api::extract::replay_response;
use crate::api::responses::{api_error, ApiError, ApiResponse, CleanupResponse};
use crate::idempotency::{validate_key, KeyStatus, ResponseLookup};
use crate::observability::{AggregatedHealth, HealthStatus};

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<AggregatedHealth>>) {
    let health = state.health_checker.check_all().await;
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (status, Json(ApiResponse::success(health)))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> (StatusCode, String) {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics exporter not installed".to_string(),
        ),
    }
}

// ============================================================================
// Idempotency Handlers
// ============================================================================

/// Replays the stored response for a key, reports it in flight, or 404s.
pub async fn get_idempotency_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    validate_key(&key).map_err(|e| {
        api_error(StatusCode::BAD_REQUEST, "INVALID_IDEMPOTENCY_KEY", e.to_string())
    })?;

    match state.idempotency.cache().try_get_response(&key).await {
        ResponseLookup::Replay(cached) => Ok(replay_response(&cached)),
        ResponseLookup::InFlight => Ok((StatusCode::OK, Json(KeyStatus::InProgress)).into_response()),
        ResponseLookup::NotFound => Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "No completed or in-flight request for this key",
        )),
    }
}

/// Runs the expiry reaper now.
pub async fn trigger_cleanup(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CleanupResponse>>, ApiError> {
    let removed = state.idempotency.reaper().sweep().await?;
    Ok(Json(ApiResponse::success(CleanupResponse { removed })))
}
