use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::api::responses::{api_error, ApiError};
use crate::idempotency::{validate_key, CachedResponse, IDEMPOTENCY_KEY_HEADER};

/// The validated `Idempotency-Key` request header. Protected write routes
/// defined by the embedding service take it as an extractor argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        idempotency_key_from_headers(&parts.headers).map(IdempotencyKey)
    }
}

pub fn idempotency_key_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "MISSING_IDEMPOTENCY_KEY",
                format!("{} header is required", IDEMPOTENCY_KEY_HEADER),
            )
        })?;

    validate_key(value)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_IDEMPOTENCY_KEY", e.to_string()))?;

    Ok(value.to_string())
}

/// Rebuilds the original response from its cached bytes, status and
/// content type.
pub fn replay_response(cached: &CachedResponse) -> Response {
    (
        cached.status(),
        [(header::CONTENT_TYPE, cached.content_type.clone())],
        cached.payload.clone(),
    )
        .into_response()
}
