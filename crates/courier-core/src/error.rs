//! Error types for persistence and domain validation.

use thiserror::Error;

use crate::models::DeliveryStatus;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The delivery state machine does not allow this move.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Status stored at the time of the update.
        from: DeliveryStatus,
        /// Requested status.
        to: DeliveryStatus,
    },
}

impl CoreError {
    /// Whether the error came from the backing store rather than the caller.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn pool_errors_are_infrastructure() {
        let err = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_infrastructure());
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = CoreError::InvalidTransition {
            from: DeliveryStatus::Delivered,
            to: DeliveryStatus::Processing,
        };
        assert_eq!(err.to_string(), "Invalid transition: delivered -> processing");
    }
}
