use crate::error::{AppError, Result};

/// Header carrying the client-supplied key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Longest key accepted, matching the width of the `key` column.
pub const MAX_KEY_LENGTH: usize = 128;

/// Checks a client-supplied key: non-empty, at most 128 characters, ASCII
/// alphanumerics, hyphens and underscores only.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "{} header is required",
            IDEMPOTENCY_KEY_HEADER
        )));
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(AppError::Validation(format!(
            "{} must be at most {} characters",
            IDEMPOTENCY_KEY_HEADER, MAX_KEY_LENGTH
        )));
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::Validation(format!(
            "Invalid {} format. Use alphanumeric characters, hyphens, or underscores",
            IDEMPOTENCY_KEY_HEADER
        )));
    }

    Ok(())
}
