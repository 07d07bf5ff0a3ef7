//! Error type for runtime operations.

use durable_core::{CodecError, JobError, QueueError, StoreError};
use durable_persistence::ConfigError;

/// Unified error type for the job runtime and scheduler.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<RuntimeError> for JobError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Store(e) => e.into(),
            RuntimeError::Cancelled => JobError::Cancelled,
            other => JobError::transient(other),
        }
    }
}
