//! Error taxonomy for synchronous engine entry points.
//!
//! Validation, not-found, and conflict errors surface eagerly to callers of
//! fanout resolution and manual delivery operations; they are never retried.
//! Transient dispatch failures live in the delivery crate's own error type
//! and never reach a synchronous caller.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for domain and persistence operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input: filter config, rate-limit duration, addressing mode.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Missing endpoint/subscription/event/delivery reference.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal manual-operation guard; no state was mutated.
    #[error("{0}")]
    Conflict(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Constraint violation (unique, foreign key, check).
    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Constraint(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::Constraint(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::Constraint(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
