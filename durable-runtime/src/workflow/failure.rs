//! Failures unwinding a workflow body.

use durable_core::{CodecError, JobError, StoreError};

/// Result of a stage, a workflow body or a rollback handler.
pub type StageResult<T> = Result<T, Failure>;

/// A classified error travelling up to the nearest retry boundary.
///
/// Returning `Err(Failure)` from a stage or body aborts the rest of that body;
/// `?` carries it through every frame until a scope driver catches it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Failure {
    pub error: JobError,
    /// Compensate every enclosing scope instead of retrying locally.
    pub rollback_all: bool,
}

impl Failure {
    pub fn new(error: JobError) -> Self {
        Self {
            error,
            rollback_all: false,
        }
    }

    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self::new(JobError::unrecoverable(err))
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::new(JobError::transient(err))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(JobError::Internal(message.into()))
    }

    pub fn cancelled() -> Self {
        Self::new(JobError::Cancelled)
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.error.is_unrecoverable()
    }

    /// Storage and cancellation failures end the attempt without compensation.
    pub fn is_abort(&self) -> bool {
        self.error.is_abort()
    }

    #[must_use]
    pub fn escalate(self) -> Self {
        Self {
            error: self.error.escalate(),
            rollback_all: self.rollback_all,
        }
    }

    #[must_use]
    pub fn with_rollback_all(mut self) -> Self {
        self.rollback_all = true;
        self
    }

    pub fn into_error(self) -> JobError {
        self.error
    }
}

impl From<JobError> for Failure {
    fn from(error: JobError) -> Self {
        Self::new(error)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.into())
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Self::new(err.into())
    }
}

impl From<CodecError> for Failure {
    fn from(err: CodecError) -> Self {
        Self::new(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(missing: bool) -> StageResult<u32> {
        if missing {
            Err(StoreError::NotFound("job".into()))?;
        }
        Ok(1)
    }

    fn parse(input: &str) -> StageResult<u32> {
        Ok(input.parse::<u32>().map_err(anyhow::Error::from)?)
    }

    #[test]
    fn test_question_mark_conversions() {
        assert_eq!(load(false).unwrap(), 1);
        assert!(load(true).unwrap_err().is_unrecoverable());

        let failure = parse("x").unwrap_err();
        assert!(matches!(failure.error, JobError::Transient(_)));

        let failure = Failure::from(StoreError::Backend("down".into()));
        assert!(failure.is_abort());
    }

    #[test]
    fn test_escalate_keeps_flag() {
        let failure = Failure::transient(anyhow::anyhow!("x")).with_rollback_all();
        let escalated = failure.escalate();
        assert!(escalated.is_unrecoverable());
        assert!(escalated.rollback_all);
        assert_eq!(escalated.to_string(), "unrecoverable: x");
    }

    #[test]
    fn test_unrecoverable_from_classified_error() {
        let failure = Failure::unrecoverable(JobError::unrecoverable(anyhow::anyhow!("gone")));
        assert_eq!(failure.to_string(), "unrecoverable: gone");
        assert!(!Failure::cancelled().is_unrecoverable());
        assert!(Failure::cancelled().is_abort());
    }
}
