//! Point-in-time states of a job record.

use crate::error::{CodecError, JobError};
use crate::registry::RunnableRegistry;
use crate::runnable::Runnable;
use bytes::Bytes;
use chrono::{DateTime, Utc};

const UNRECOVERABLE_PREFIX: &str = "unrecoverable: ";

/// One immutable entry in a record's snapshot log.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Id of the owning record.
    pub job_id: String,
    /// Position in the log, starting at zero.
    pub index: u64,
    /// Encoded runnable (envelope).
    pub state: Bytes,
    /// Optional human readable note, such as the stage that was committed.
    pub description: Option<String>,
    /// Error reported by the attempt that wrote this snapshot.
    pub error: Option<String>,
    /// Whether this is the terminal snapshot of the record.
    pub is_final: bool,
    /// Strictly increasing within a record.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Decode the stored runnable.
    pub fn decode_runnable(
        &self,
        registry: &RunnableRegistry,
    ) -> Result<Box<dyn Runnable>, CodecError> {
        registry.decode(&self.state)
    }

    /// Reconstruct the stored outcome.
    ///
    /// A stored error on a final snapshot is reported as unrecoverable; on a
    /// non-final one it is transient. The rebuilt error displays as stored.
    pub fn result(&self) -> Result<(), JobError> {
        match &self.error {
            None => Ok(()),
            Some(message) if self.is_final => {
                let message = message
                    .strip_prefix(UNRECOVERABLE_PREFIX)
                    .unwrap_or(message);
                Err(JobError::Unrecoverable(anyhow::anyhow!("{message}")))
            }
            Some(message) => Err(JobError::transient(anyhow::anyhow!("{message}"))),
        }
    }

    /// Whether `self` was written after `other` in the same log.
    pub fn is_newer_than(&self, other: &Snapshot) -> bool {
        self.index > other.index
    }
}

/// Options applied when appending a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub description: Option<String>,
    pub error: Option<String>,
    pub is_final: bool,
}

impl SnapshotOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Record the error of an attempt, if any.
    #[must_use]
    pub fn with_error(mut self, error: Option<&JobError>) -> Self {
        self.error = error.map(ToString::to_string);
        self
    }

    #[must_use]
    pub fn as_final(mut self, is_final: bool) -> Self {
        self.is_final = is_final;
        self
    }
}
