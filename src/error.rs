use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the request pipeline and the outbox.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed client-supplied idempotency key.
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A request with the same key is still executing.
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        retry_after_secs: u64,
    },

    /// The key was already used by this principal for a different payload.
    #[error("Idempotency key reused: {0}")]
    KeyReused(String),

    /// A business uniqueness constraint was violated.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("Send failure: {0}")]
    SendFailure(String),

    #[error("Task {task_id} exhausted after {attempts} attempts")]
    TaskExhausted { task_id: Uuid, attempts: i32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Short machine-readable code used in error bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidKey(_) => "INVALID_IDEMPOTENCY_KEY",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Conflict { .. } => "REQUEST_IN_PROGRESS",
            AppError::KeyReused(_) => "IDEMPOTENCY_KEY_REUSED",
            AppError::Duplicate(_) => "DUPLICATE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AppError::SendFailure(_) => "SEND_FAILURE",
            AppError::TaskExhausted { .. } => "TASK_EXHAUSTED",
            AppError::Serialization(_) | AppError::Config(_) | AppError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::InvalidKey("x".into()).code(), "INVALID_IDEMPOTENCY_KEY");
        assert_eq!(
            AppError::Conflict {
                message: "busy".into(),
                retry_after_secs: 1
            }
            .code(),
            "REQUEST_IN_PROGRESS"
        );
        assert_eq!(
            AppError::StoreUnavailable(sqlx::Error::PoolTimedOut).code(),
            "STORE_UNAVAILABLE"
        );
    }
}
