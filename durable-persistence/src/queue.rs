//! Work queue contracts.
//!
//! [`Queue`] is what the scheduler drives. [`LeaseBackend`] is the narrow
//! storage interface the generic [`LeaseQueue`](crate::LeaseQueue) needs:
//! ordered lookup of runnable items plus compare-and-swap on the attempt
//! counter. Any backend offering those two primitives gets lease exclusivity
//! for free.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durable_core::{JobError, QueueError, WorkItem};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Handler invoked with the leased item.
pub type WorkHandler = Box<dyn FnOnce(WorkItem) -> BoxFuture<'static, Result<(), JobError>> + Send>;

/// At-least-once dispatch of job ids to workers.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Make `job_id` immediately eligible for execution.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Duplicate` if the job is already scheduled.
    async fn schedule(&self, job_id: &str) -> Result<(), QueueError>;

    /// Wait for an item, lease it and run `handler` while keeping the lease alive.
    ///
    /// The item is acknowledged when the handler succeeds or fails with an
    /// unrecoverable error. Any other failure leaves it to be retried once the
    /// lease expires.
    ///
    /// Once an item is leased the handler always runs to completion; it must
    /// observe `cancel` itself. A handler that fails after cancellation gets
    /// its lease released so another worker can pick the item up at once.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Cancelled` on cancellation and `QueueError::Handler`
    /// when the handler fails.
    async fn run_next(
        &self,
        cancel: &CancellationToken,
        handler: WorkHandler,
    ) -> Result<(), QueueError>;

    /// Stop handing out work.
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Storage primitives for a lease queue.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Insert a new item.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Duplicate` if an item for the same job exists.
    async fn insert(&self, item: WorkItem) -> Result<(), QueueError>;

    /// The item in `channel` with the earliest deadline that is runnable at `now`.
    async fn next_runnable(
        &self,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>, QueueError>;

    /// Replace the stored item with `replacement` if its attempt counter still
    /// equals `expected.attempt_count`.
    ///
    /// Returns `Ok(false)` if the item changed hands or no longer exists.
    async fn compare_and_swap(
        &self,
        expected: &WorkItem,
        replacement: WorkItem,
    ) -> Result<bool, QueueError>;

    /// Delete the item if it is still held under `lease`.
    async fn remove_leased(&self, lease: &WorkItem) -> Result<bool, QueueError>;

    /// Look up the item for a job.
    async fn get(&self, job_id: &str) -> Result<Option<WorkItem>, QueueError>;
}
