//! Error types for durable jobs.
//!
//! [`JobError`] is the classified outcome of user code. The classification
//! decides what the rest of the system does with a failure:
//!
//! - [`JobError::Unrecoverable`] finalizes the job, triggers compensation and is never retried.
//! - [`JobError::Transient`] and [`JobError::Internal`] are retried with backoff.
//! - [`JobError::Storage`] and [`JobError::Cancelled`] abort the current attempt; the queue
//!   lease expires and another worker resumes from the last durable snapshot.

/// Error raised while encoding or decoding a persisted blob.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload could not be serialized.
    #[error("Encode error: {0}")]
    Encode(String),
    /// The payload could not be deserialized.
    #[error("Decode error: {0}")]
    Decode(String),
    /// The envelope names a type that was never registered.
    #[error("Unknown type '{0}': not found in registry")]
    UnknownType(String),
    /// The envelope was written by an incompatible format version.
    #[error("Unsupported envelope version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version this build understands.
        expected: u32,
        /// Version found in the blob.
        found: u32,
    },
}

/// Error type for snapshot store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),
    /// The record already holds a final snapshot; its log is closed.
    #[error("Record {0} is final, no further snapshots can be added")]
    AlreadyFinal(String),
    /// A blocking read was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
    /// Serialization/deserialization error.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Error type for lease queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The job is already scheduled on this queue.
    #[error("Job already scheduled: {0}")]
    Duplicate(String),
    /// `run_next` was cancelled before a handler completed.
    #[error("Operation cancelled")]
    Cancelled,
    /// The queue was closed.
    #[error("Queue closed")]
    Closed,
    /// The handler failed; the item was acknowledged only if the error is unrecoverable.
    #[error("Handler failed for job {job_id}: {source}")]
    Handler {
        /// Job the handler was running.
        job_id: String,
        /// Classified handler error.
        #[source]
        source: JobError,
    },
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Classified failure of a job or workflow body.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Terminal failure. The job is finalized with this error.
    #[error("unrecoverable: {0:#}")]
    Unrecoverable(anyhow::Error),
    /// Any other failure; eligible for retry.
    #[error("{0:#}")]
    Transient(anyhow::Error),
    /// An abort that did not carry a structured error, such as a panic.
    #[error("internal error: {0}")]
    Internal(String),
    /// Persisting progress failed.
    #[error("storage error: {0}")]
    Storage(#[source] StoreError),
    /// The attempt was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    /// Wrap an error as unrecoverable.
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        match err.downcast::<JobError>() {
            Ok(JobError::Unrecoverable(inner)) => JobError::Unrecoverable(inner),
            Ok(other) => JobError::Unrecoverable(anyhow::Error::new(other)),
            Err(err) => JobError::Unrecoverable(err),
        }
    }

    /// Wrap an error as transient.
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        JobError::Transient(err.into())
    }

    /// Whether this error forbids any further attempt.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, JobError::Unrecoverable(_))
    }

    /// Whether this error aborts the attempt without in-process retry.
    pub fn is_abort(&self) -> bool {
        matches!(self, JobError::Storage(_) | JobError::Cancelled)
    }

    /// Reclassify as unrecoverable, keeping the message.
    #[must_use]
    pub fn escalate(self) -> Self {
        match self {
            JobError::Unrecoverable(_) => self,
            other => JobError::Unrecoverable(anyhow::Error::new(other)),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<JobError>() {
            Ok(classified) => classified,
            Err(err) => JobError::Transient(err),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            // A record that no longer exists can never make progress.
            StoreError::NotFound(id) => {
                JobError::Unrecoverable(anyhow::anyhow!("record not found: {id}"))
            }
            StoreError::Cancelled => JobError::Cancelled,
            other => JobError::Storage(other),
        }
    }
}

impl From<CodecError> for JobError {
    fn from(err: CodecError) -> Self {
        JobError::Transient(err.into())
    }
}
