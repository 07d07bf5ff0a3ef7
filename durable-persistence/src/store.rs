//! Snapshot store contract.
//!
//! A [`Store`] owns job records; a [`Record`] is the durable identity of one
//! scheduled job plus its append-only snapshot log. Every record has at least
//! one snapshot, timestamps are strictly increasing and at most one snapshot is
//! final, which must be the last.

use async_trait::async_trait;
use bytes::Bytes;
use durable_core::{encode_runnable, Runnable, Snapshot, SnapshotOptions, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default interval between polls in [`Record::wait_for_update`].
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Storage of job records.
///
/// # Example
///
/// ```rust,ignore
/// use durable_persistence::{InMemoryStore, Store};
///
/// let store = InMemoryStore::new();
/// let record = store.create(&SendEmail::new("ops@example.com"), &["email"]).await?;
/// let same = store.load(record.job_id()).await?;
/// assert_eq!(store.search_by_tag("email").await?, vec![record.job_id().to_string()]);
/// ```
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a record whose first, non-final snapshot holds `runnable`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the runnable cannot be encoded or the record cannot be written.
    async fn create(
        &self,
        runnable: &dyn Runnable,
        tags: &[&str],
    ) -> Result<Arc<dyn Record>, StoreError>;

    /// Load a record by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record exists for the given id.
    async fn load(&self, job_id: &str) -> Result<Arc<dyn Record>, StoreError>;

    /// All record ids carrying `tag`, in no particular order.
    async fn search_by_tag(&self, tag: &str) -> Result<Vec<String>, StoreError>;

    /// Delete a record, its snapshots and its tag index entries.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record exists for the given id.
    async fn delete(&self, job_id: &str) -> Result<(), StoreError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Durable identity and snapshot log of one job.
#[async_trait]
pub trait Record: Send + Sync {
    fn job_id(&self) -> &str;

    /// Tags the record was created with.
    fn tags(&self) -> &[String];

    /// Append a snapshot holding the encoded runnable `state`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyFinal` if the log already ends with a final snapshot.
    async fn add_snapshot(
        &self,
        state: Bytes,
        options: SnapshotOptions,
    ) -> Result<Snapshot, StoreError>;

    /// The newest snapshot.
    async fn last_snapshot(&self) -> Result<Snapshot, StoreError>;

    /// Snapshots written after `after`, oldest first; the whole log for `None`.
    async fn snapshots_since(&self, after: Option<&Snapshot>) -> Result<Vec<Snapshot>, StoreError>;

    /// Encode `runnable` and append it as a snapshot.
    async fn add_runnable(
        &self,
        runnable: &dyn Runnable,
        options: SnapshotOptions,
    ) -> Result<Snapshot, StoreError> {
        let state = encode_runnable(runnable)?;
        self.add_snapshot(state, options).await
    }

    /// How often [`wait_for_update`](Record::wait_for_update) re-reads the log.
    fn poll_interval(&self) -> Duration {
        DEFAULT_WAIT_POLL_INTERVAL
    }

    /// Block until a snapshot newer than `after` exists.
    ///
    /// Returns immediately if one already exists. The default implementation
    /// polls; backends with a local wake-up signal should override it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Cancelled` when `cancel` fires and
    /// `StoreError::AlreadyFinal` if `after` is final, since no update can follow it.
    async fn wait_for_update(
        &self,
        cancel: &CancellationToken,
        after: &Snapshot,
    ) -> Result<(), StoreError> {
        if after.is_final {
            return Err(StoreError::AlreadyFinal(self.job_id().to_string()));
        }
        loop {
            if self.last_snapshot().await?.is_newer_than(after) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }
}
