use thiserror::Error;

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("A transaction is already active on this unit of work")]
    TransactionAlreadyActive,

    #[error("Transient storage fault persisted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::TransactionAlreadyActive => "TRANSACTION_ACTIVE",
            AppError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_exhausted_wraps_source() {
        let err = AppError::RetriesExhausted {
            attempts: 3,
            source: Box::new(AppError::Database(sqlx::Error::PoolTimedOut)),
        };

        assert_eq!(err.code(), "RETRIES_EXHAUSTED");
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_codes() {
        assert_eq!(AppError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(AppError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(AppError::TransactionAlreadyActive.code(), "TRANSACTION_ACTIVE");
    }
}
