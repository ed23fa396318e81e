//! Error taxonomy for the operation engine
//!
//! Validation and conflict errors are returned synchronously to callers that
//! create operations. Action errors are recorded on the operation row by the
//! scheduler and never reach the caller of a cascade trigger.

use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Errors surfaced by the operation store, the cascade builder, the scheduler
/// and the maintainer.
#[derive(Debug, Error)]
pub enum OperationError {
    /// Malformed input, rejected before any state write
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A non-terminal operation already exists for the resource
    #[error("resource {resource_id} already has an operation in progress")]
    Conflict { resource_id: String },

    #[error("transient action failure: {0}")]
    TransientAction(String),

    #[error("permanent action failure: {0}")]
    PermanentAction(String),

    /// Propagated from the storage engine; always aborts the enclosing transaction
    #[error("storage error: {0}")]
    Storage(#[from] DbErr),
}

impl OperationError {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            OperationError::Validation(_) => "VALIDATION_ERROR",
            OperationError::NotFound(_) => "NOT_FOUND",
            OperationError::Conflict { .. } => "CONFLICT",
            OperationError::TransientAction(_) => "TRANSIENT_ACTION_ERROR",
            OperationError::PermanentAction(_) => "PERMANENT_ACTION_ERROR",
            OperationError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Maps a write failure for `resource_id`, turning a violation of the
    /// active-operation unique index into a conflict.
    pub fn from_write(err: DbErr, resource_id: &str) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => OperationError::Conflict {
                resource_id: resource_id.to_string(),
            },
            _ => OperationError::Storage(err),
        }
    }
}

/// Failure reported by a target-resource action
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// Retryable (network errors, 5xx, rate limiting)
    #[error("{0}")]
    Transient(String),

    /// Not retryable; the operation moves to FAILED
    #[error("{0}")]
    Permanent(String),
}

impl From<ActionError> for OperationError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::Transient(msg) => OperationError::TransientAction(msg),
            ActionError::Permanent(msg) => OperationError::PermanentAction(msg),
        }
    }
}
