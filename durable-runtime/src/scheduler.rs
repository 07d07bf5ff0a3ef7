//! Scheduler tying a [`Store`] and a [`Queue`] together.
//!
//! ```rust,ignore
//! let scheduler = Scheduler::new(store, queue, registry);
//! let cancel = CancellationToken::new();
//! scheduler.spawn_workers(4, &cancel);
//!
//! let record = scheduler.enqueue(&job, &["nightly"]).await?;
//! let snapshot = scheduler.wait_for_completion(&cancel, record.as_ref()).await?;
//! snapshot.result()?;
//!
//! cancel.cancel();
//! scheduler.close().await?;
//! ```

use crate::error::RuntimeError;
use crate::runner::JobRunner;
use durable_core::{
    JobError, QueueError, Runnable, RunnableRegistry, Snapshot, StoreError, WorkItem,
};
use durable_persistence::{Queue, Record, Store, WorkHandler};
use futures::FutureExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

async fn run_item(
    store: Arc<dyn Store>,
    runner: JobRunner,
    cancel: CancellationToken,
    item: WorkItem,
) -> Result<(), JobError> {
    let record = store.load(&item.job_id).await?;
    let snapshot = runner.run(record, &cancel).await?;
    if snapshot.is_final {
        Ok(())
    } else {
        // Not acknowledged: the lease expires and another attempt resumes it.
        Err(JobError::transient(anyhow::anyhow!(
            "job {} not finished after attempt {}",
            item.job_id,
            item.attempt_count
        )))
    }
}

/// Enqueues jobs, runs worker loops and waits for completion.
///
/// Cloning is cheap; clones share the store, queue and the set of tracked loops.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    runner: JobRunner,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, registry: RunnableRegistry) -> Self {
        Self {
            store,
            queue,
            runner: JobRunner::new(Arc::new(registry)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &RunnableRegistry {
        self.runner.registry()
    }

    /// Create a record for `runnable` and schedule it.
    pub async fn enqueue(
        &self,
        runnable: &dyn Runnable,
        tags: &[&str],
    ) -> Result<Arc<dyn Record>, RuntimeError> {
        let record = self.store.create(runnable, tags).await?;
        self.queue.schedule(record.job_id()).await?;
        tracing::debug!(
            job_id = %record.job_id(),
            job_type = runnable.type_name(),
            "Enqueued job"
        );
        Ok(record)
    }

    fn handler(&self, cancel: &CancellationToken) -> WorkHandler {
        let store = self.store.clone();
        let runner = self.runner.clone();
        let cancel = cancel.clone();
        Box::new(move |item: WorkItem| run_item(store, runner, cancel, item).boxed())
    }

    /// Run jobs until `cancel` fires.
    ///
    /// Queue and handler errors are logged and polling continues.
    pub async fn worker_loop(&self, cancel: CancellationToken) {
        let _token = self.tracker.token();
        tracing::debug!("Worker loop started");

        while !cancel.is_cancelled() {
            match self.queue.run_next(&cancel, self.handler(&cancel)).await {
                Ok(()) => {}
                Err(QueueError::Cancelled) => break,
                Err(QueueError::Closed) => {
                    tracing::debug!("Queue closed, stopping worker loop");
                    break;
                }
                Err(QueueError::Handler { job_id, source }) => {
                    tracing::debug!(
                        job_id = %job_id,
                        error = %source,
                        "Job attempt did not finish"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Worker loop error");
                }
            }
        }

        tracing::debug!("Worker loop stopped");
    }

    /// Spawn `count` worker loops tracked by this scheduler.
    pub fn spawn_workers(&self, count: usize, cancel: &CancellationToken) {
        for _ in 0..count {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            self.tracker
                .spawn(async move { scheduler.worker_loop(cancel).await });
        }
    }

    /// Wait until the record holds a final snapshot and return it.
    ///
    /// The job's own failure is reported through [`Snapshot::result`], not as
    /// an error of this call.
    pub async fn wait_for_completion(
        &self,
        cancel: &CancellationToken,
        record: &dyn Record,
    ) -> Result<Snapshot, RuntimeError> {
        let _token = self.tracker.token();
        loop {
            let last = record.last_snapshot().await?;
            if last.is_final {
                return Ok(last);
            }
            match record.wait_for_update(cancel, &last).await {
                Ok(()) => {}
                Err(StoreError::Cancelled) => return Err(RuntimeError::Cancelled),
                // Finalized between the read and the wait.
                Err(StoreError::AlreadyFinal(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait for every worker loop and waiter, then close the queue and store.
    ///
    /// Cancel the tokens passed to them first, or this never returns.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        self.tracker.close();
        self.tracker.wait().await;
        self.queue.close().await?;
        self.store.close().await?;
        tracing::debug!("Scheduler closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use durable_core::{Durable, Job, JobRuntime, SnapshotOptions};
    use durable_persistence::{
        InMemoryLeaseBackend, InMemoryStore, LeaseBackend, LeaseQueue, QueueConfig,
    };
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Debug, Serialize, Deserialize)]
    struct Tally {
        remaining: u32,
    }

    impl Durable for Tally {
        const TYPE_NAME: &'static str = "tally";
    }

    #[async_trait]
    impl Job for Tally {
        async fn run(&mut self, _rt: &dyn JobRuntime) -> Result<(), JobError> {
            if self.remaining > 0 {
                self.remaining -= 1;
                return Err(JobError::transient(anyhow::anyhow!("{} left", self.remaining + 1)));
            }
            Ok(())
        }
    }

    static SLOW_STARTED: AtomicBool = AtomicBool::new(false);

    /// Runs until the attempt is cancelled.
    #[derive(Debug, Serialize, Deserialize)]
    struct Slow;

    impl Durable for Slow {
        const TYPE_NAME: &'static str = "slow";
    }

    #[async_trait]
    impl Job for Slow {
        async fn run(&mut self, rt: &dyn JobRuntime) -> Result<(), JobError> {
            SLOW_STARTED.store(true, Ordering::SeqCst);
            rt.cancellation().cancelled().await;
            Err(JobError::transient(anyhow::anyhow!("interrupted")))
        }
    }

    fn fast_queue() -> QueueConfig {
        QueueConfig::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_millis(20))
    }

    fn scheduler() -> (Scheduler, Arc<InMemoryLeaseBackend>) {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let queue = LeaseQueue::with_backend(backend.clone(), fast_queue()).unwrap();
        let mut registry = RunnableRegistry::new();
        registry.register::<Tally>().register::<Slow>();
        let scheduler = Scheduler::new(Arc::new(InMemoryStore::new()), Arc::new(queue), registry);
        (scheduler, backend)
    }

    #[tokio::test]
    async fn test_unfinished_job_is_retried_until_final() {
        let (scheduler, backend) = scheduler();
        let cancel = CancellationToken::new();
        scheduler.spawn_workers(2, &cancel);

        let record = scheduler.enqueue(&Tally { remaining: 1 }, &["batch"]).await.unwrap();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.wait_for_completion(&cancel, record.as_ref()),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(snapshot.is_final);
        assert!(snapshot.result().is_ok());
        let log = record.snapshots_since(None).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].error.as_deref(), Some("1 left"));
        assert_eq!(
            scheduler.store().search_by_tag("batch").await.unwrap(),
            vec![record.job_id().to_string()]
        );

        // The final attempt acknowledged the item.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.is_empty());

        cancel.cancel();
        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_record_is_acknowledged() {
        let (scheduler, backend) = scheduler();
        let record = scheduler.enqueue(&Tally { remaining: 0 }, &[]).await.unwrap();
        scheduler.store().delete(record.job_id()).await.unwrap();

        let cancel = CancellationToken::new();
        scheduler.spawn_workers(1, &cancel);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !backend.is_empty() {
            assert!(Instant::now() < deadline, "item for deleted record never acknowledged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_promptly_after_final_snapshot() {
        let (scheduler, _) = scheduler();
        let record = scheduler.enqueue(&Tally { remaining: 0 }, &[]).await.unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let scheduler = scheduler.clone();
            let record = record.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let snapshot = scheduler
                    .wait_for_completion(&cancel, record.as_ref())
                    .await
                    .unwrap();
                (snapshot, Instant::now())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let appended = record
            .add_runnable(&Tally { remaining: 0 }, SnapshotOptions::new().as_final(true))
            .await
            .unwrap();
        let appended_at = Instant::now();

        let (snapshot, returned_at) = waiter.await.unwrap();
        assert_eq!(snapshot, appended);
        assert!(returned_at.duration_since(appended_at) < Duration::from_millis(250));

        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let (scheduler, _) = scheduler();
        let record = scheduler.enqueue(&Tally { remaining: 0 }, &[]).await.unwrap();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = scheduler.wait_for_completion(&cancel, record.as_ref()).await;
        assert!(matches!(result, Err(RuntimeError::Cancelled)));
        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_enqueue() {
        let (scheduler, _) = scheduler();
        scheduler.close().await.unwrap();
        let result = scheduler.enqueue(&Tally { remaining: 0 }, &[]).await;
        assert!(matches!(result, Err(RuntimeError::Queue(QueueError::Closed))));
    }

    #[tokio::test]
    async fn test_cancelled_attempt_still_writes_snapshot() {
        let (scheduler, backend) = scheduler();
        let record = scheduler.enqueue(&Slow, &[]).await.unwrap();
        let cancel = CancellationToken::new();
        scheduler.spawn_workers(1, &cancel);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !SLOW_STARTED.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "job never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        scheduler.close().await.unwrap();

        let log = record.snapshots_since(None).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(!log[1].is_final);
        assert_eq!(log[1].error.as_deref(), Some("interrupted"));

        // The lease was handed back for the next worker.
        let item = backend.get(record.job_id()).await.unwrap().unwrap();
        assert!(item.is_runnable(chrono::Utc::now()));
    }
}
