//! Error types for the deploy service

use thiserror::Error;

use crate::step::StepError;

/// Main error type for the deploy service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Malformed submission, returned synchronously to the caller
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A status change that the state machine does not allow
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    StepError(#[from] StepError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}
