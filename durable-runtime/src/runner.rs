//! Drives one execution attempt of a job record.
//!
//! Every attempt ends with exactly one new snapshot, success or not, so
//! progress is never silently lost:
//!
//! 1. If the last snapshot is final, it is returned as-is.
//! 2. The runnable is decoded from the last snapshot and run against a
//!    [`JobRuntime`] bound to the record.
//! 3. `Ok` and unrecoverable errors finalize the record; anything else leaves
//!    it open for the queue to retry.

use crate::error::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use durable_core::{
    encode_runnable, JobError, JobRuntime, RunnableRegistry, Snapshot, SnapshotOptions, StoreError,
};
use durable_persistence::Record;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runtime handle bound to one record for the duration of an attempt.
struct RecordRuntime<'a> {
    record: &'a dyn Record,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl JobRuntime for RecordRuntime<'_> {
    fn id(&self) -> &str {
        self.record.job_id()
    }

    fn cancellation(&self) -> &CancellationToken {
        self.cancel
    }

    async fn update(&self, state: Bytes, options: SnapshotOptions) -> Result<(), StoreError> {
        self.record.add_snapshot(state, options.as_final(false)).await?;
        Ok(())
    }
}

/// Executes job attempts against records.
///
/// # Example
///
/// ```rust,ignore
/// let runner = JobRunner::new(registry);
/// let snapshot = runner.run(record, &cancel).await?;
/// if snapshot.is_final {
///     snapshot.result()?;
/// }
/// ```
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<RunnableRegistry>,
}

impl JobRunner {
    pub fn new(registry: Arc<RunnableRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RunnableRegistry {
        &self.registry
    }

    /// Run one attempt and return the snapshot it wrote.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if the record cannot be read, the runnable cannot
    /// be decoded or re-encoded, or the resulting snapshot cannot be appended.
    /// Failures of the job itself are recorded in the snapshot, not returned.
    pub async fn run(
        &self,
        record: Arc<dyn Record>,
        cancel: &CancellationToken,
    ) -> Result<Snapshot, RuntimeError> {
        let last = record.last_snapshot().await?;
        if last.is_final {
            tracing::debug!(job_id = %record.job_id(), "Job already final, nothing to run");
            return Ok(last);
        }

        let mut runnable = last.decode_runnable(&self.registry)?;
        let runtime = RecordRuntime {
            record: record.as_ref(),
            cancel,
        };

        tracing::debug!(
            job_id = %record.job_id(),
            job_type = runnable.type_name(),
            snapshot = last.index,
            "Running job"
        );
        let result = runnable.run(&runtime).await;

        let is_final = is_final_outcome(&result);
        let error = result.as_ref().err();
        match error {
            None => tracing::info!(job_id = %record.job_id(), "Job completed"),
            Some(err) if is_final => tracing::error!(
                job_id = %record.job_id(),
                error = %err,
                "Job failed permanently"
            ),
            Some(err) => tracing::warn!(
                job_id = %record.job_id(),
                error = %err,
                "Job attempt failed, will be retried"
            ),
        }

        let state = encode_runnable(runnable.as_ref())?;
        let snapshot = record
            .add_snapshot(
                state,
                SnapshotOptions::new()
                    .with_error(error)
                    .as_final(is_final),
            )
            .await?;
        Ok(snapshot)
    }
}

/// Whether an error returned by a job attempt should finalize the record.
pub fn is_final_outcome(result: &Result<(), JobError>) -> bool {
    result.as_ref().map_or_else(JobError::is_unrecoverable, |_| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use durable_core::{Durable, Job};
    use durable_persistence::{InMemoryStore, Store};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Countdown {
        remaining: u32,
        fatal: bool,
    }

    impl Durable for Countdown {
        const TYPE_NAME: &'static str = "countdown";
    }

    #[async_trait]
    impl Job for Countdown {
        async fn run(&mut self, rt: &dyn JobRuntime) -> Result<(), JobError> {
            assert!(!rt.id().is_empty());
            if self.fatal {
                return Err(JobError::unrecoverable(anyhow::anyhow!("fatal")));
            }
            if self.remaining > 0 {
                self.remaining -= 1;
                return Err(JobError::transient(anyhow::anyhow!("not yet")));
            }
            Ok(())
        }
    }

    fn runner() -> JobRunner {
        let mut registry = RunnableRegistry::new();
        registry.register::<Countdown>();
        JobRunner::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_transient_failure_is_not_final() {
        let store = InMemoryStore::new();
        let record = store
            .create(&Countdown { remaining: 1, fatal: false }, &[])
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let runner = runner();

        let first = runner.run(record.clone(), &cancel).await.unwrap();
        assert!(!first.is_final);
        assert_eq!(first.error.as_deref(), Some("not yet"));

        // The decremented state was persisted, so the next attempt succeeds.
        let second = runner.run(record.clone(), &cancel).await.unwrap();
        assert!(second.is_final);
        assert!(second.result().is_ok());
        assert_eq!(record.snapshots_since(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unrecoverable_is_final() {
        let store = InMemoryStore::new();
        let record = store
            .create(&Countdown { remaining: 0, fatal: true }, &[])
            .await
            .unwrap();
        let snapshot = runner()
            .run(record, &CancellationToken::new())
            .await
            .unwrap();
        assert!(snapshot.is_final);
        assert!(snapshot.result().unwrap_err().is_unrecoverable());
    }

    #[tokio::test]
    async fn test_final_record_is_noop() {
        let store = InMemoryStore::new();
        let record = store
            .create(&Countdown { remaining: 0, fatal: false }, &[])
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let runner = runner();

        let done = runner.run(record.clone(), &cancel).await.unwrap();
        let again = runner.run(record.clone(), &cancel).await.unwrap();
        assert_eq!(done, again);
        assert_eq!(record.snapshots_since(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_type_is_an_error() {
        let store = InMemoryStore::new();
        let record = store
            .create(&Countdown { remaining: 0, fatal: false }, &[])
            .await
            .unwrap();
        let runner = JobRunner::new(Arc::new(RunnableRegistry::new()));
        let err = runner
            .run(record, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Codec(_)));
    }

    #[test]
    fn test_is_final_outcome() {
        assert!(is_final_outcome(&Ok(())));
        assert!(is_final_outcome(&Err(JobError::unrecoverable(
            anyhow::anyhow!("x")
        ))));
        assert!(!is_final_outcome(&Err(JobError::Cancelled)));
    }
}
