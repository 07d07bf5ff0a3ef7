//! Generic lease queue over any [`LeaseBackend`].
//!
//! Items are acquired by compare-and-swap on their attempt counter, which also
//! pushes their deadline forward by the lease duration. While the handler runs,
//! a heartbeat task renews the lease with the same compare-and-swap, so a
//! worker that lost its lease notices on the next beat instead of silently
//! extending someone else's.
//!
//! Items scheduled through this instance are also offered to a worker already
//! blocked in [`run_next`](Queue::run_next), which saves a poll interval.
//!
//! # Example
//!
//! ```rust,ignore
//! use durable_persistence::{InMemoryLeaseBackend, LeaseQueue, Queue, QueueConfig};
//!
//! let queue = LeaseQueue::new(InMemoryLeaseBackend::new(), QueueConfig::default())?;
//! queue.schedule("job-1").await?;
//! queue
//!     .run_next(&cancel, Box::new(|item| process(item).boxed()))
//!     .await?;
//! ```

use crate::config::{ConfigError, QueueConfig};
use crate::queue::{LeaseBackend, Queue, WorkHandler};
use async_trait::async_trait;
use chrono::Utc;
use durable_core::{QueueError, WorkItem};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A queue that leases items from a [`LeaseBackend`].
pub struct LeaseQueue<B> {
    backend: Arc<B>,
    config: QueueConfig,
    handoff_tx: mpsc::Sender<WorkItem>,
    handoff_rx: Mutex<mpsc::Receiver<WorkItem>>,
    closed: CancellationToken,
}

impl<B> LeaseQueue<B>
where
    B: LeaseBackend + 'static,
{
    /// Create a queue.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is inconsistent.
    pub fn new(backend: B, config: QueueConfig) -> Result<Self, ConfigError> {
        Self::with_backend(Arc::new(backend), config)
    }

    /// Create a queue over a shared backend, e.g. to simulate several processes.
    pub fn with_backend(backend: Arc<B>, config: QueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (handoff_tx, handoff_rx) = mpsc::channel(1);
        Ok(Self {
            backend,
            config,
            handoff_tx,
            handoff_rx: Mutex::new(handoff_rx),
            closed: CancellationToken::new(),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn recv_handoff(&self) -> Option<WorkItem> {
        self.handoff_rx.lock().await.recv().await
    }

    async fn poll(&self) -> Option<WorkItem> {
        match self
            .backend
            .next_runnable(&self.config.channel, Utc::now())
            .await
        {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(
                    channel = %self.config.channel,
                    error = %e,
                    "Failed to poll queue"
                );
                None
            }
        }
    }

    async fn acquire(&self, candidate: &WorkItem) -> Option<WorkItem> {
        let lease = chrono::Duration::from_std(self.config.lease_duration()).ok()?;
        let leased = candidate.leased(Utc::now(), lease);

        match self
            .backend
            .compare_and_swap(candidate, leased.clone())
            .await
        {
            Ok(true) => {
                tracing::debug!(
                    job_id = %leased.job_id,
                    attempt = leased.attempt_count,
                    "Acquired lease"
                );
                Some(leased)
            }
            Ok(false) => {
                tracing::trace!(job_id = %candidate.job_id, "Lease taken by another worker");
                None
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %candidate.job_id,
                    error = %e,
                    "Failed to acquire lease"
                );
                None
            }
        }
    }

    fn spawn_heartbeat(&self, lease: WorkItem) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let interval = self.config.heartbeat_interval();
        let lease_duration = self.config.lease_duration();

        tokio::spawn(async move {
            let mut interval_timer = time::interval(interval);
            interval_timer.tick().await; // Skip first immediate tick

            loop {
                interval_timer.tick().await;

                tracing::trace!(job_id = %lease.job_id, "Extending lease via heartbeat");

                let Ok(extension) = chrono::Duration::from_std(lease_duration) else {
                    return;
                };
                let renewed = WorkItem {
                    runnable_at: Utc::now() + extension,
                    ..lease.clone()
                };
                match backend.compare_and_swap(&lease, renewed).await {
                    Ok(true) => {
                        tracing::trace!(job_id = %lease.job_id, "Extended lease via heartbeat");
                    }
                    Ok(false) => {
                        tracing::warn!(
                            job_id = %lease.job_id,
                            attempt = lease.attempt_count,
                            "Lease lost, stopping heartbeat"
                        );
                        return;
                    }
                    Err(e) => {
                        // The next beat may still succeed before the lease runs out.
                        tracing::warn!(
                            job_id = %lease.job_id,
                            error = %e,
                            "Failed to extend lease during heartbeat"
                        );
                    }
                }
            }
        })
    }

    async fn acknowledge(&self, lease: &WorkItem) -> Result<(), QueueError> {
        if !self.backend.remove_leased(lease).await? {
            tracing::warn!(
                job_id = %lease.job_id,
                attempt = lease.attempt_count,
                "Lease was taken over before acknowledgement"
            );
        }
        Ok(())
    }

    // Make the item runnable again right away instead of waiting for the lease to expire.
    async fn release(&self, lease: &WorkItem) {
        let released = WorkItem {
            runnable_at: Utc::now(),
            ..lease.clone()
        };
        if let Err(e) = self.backend.compare_and_swap(lease, released).await {
            tracing::warn!(job_id = %lease.job_id, error = %e, "Failed to release lease");
        }
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        lease: WorkItem,
        handler: WorkHandler,
    ) -> Result<(), QueueError> {
        let heartbeat = self.spawn_heartbeat(lease.clone());

        tracing::debug!(job_id = %lease.job_id, "Running handler");
        // The handler sees the same token; it is awaited so its outcome is recorded.
        let result = handler(lease.clone()).await;
        heartbeat.abort();

        match result {
            Ok(()) => self.acknowledge(&lease).await,
            Err(err) if err.is_unrecoverable() => {
                self.acknowledge(&lease).await?;
                Err(QueueError::Handler {
                    job_id: lease.job_id,
                    source: err,
                })
            }
            Err(err) if cancel.is_cancelled() => {
                tracing::debug!(
                    job_id = %lease.job_id,
                    error = %err,
                    "Handler stopped by cancellation, releasing lease"
                );
                self.release(&lease).await;
                Err(QueueError::Cancelled)
            }
            Err(err) => {
                tracing::debug!(
                    job_id = %lease.job_id,
                    error = %err,
                    "Handler failed, leaving item for retry"
                );
                Err(QueueError::Handler {
                    job_id: lease.job_id,
                    source: err,
                })
            }
        }
    }
}

#[async_trait]
impl<B> Queue for LeaseQueue<B>
where
    B: LeaseBackend + 'static,
{
    async fn schedule(&self, job_id: &str) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let item = WorkItem::new(job_id, self.config.channel.as_str());
        self.backend.insert(item.clone()).await?;

        if self.handoff_tx.try_send(item).is_ok() {
            tracing::trace!(job_id = %job_id, "Offered job to local worker");
        }
        Ok(())
    }

    async fn run_next(
        &self,
        cancel: &CancellationToken,
        handler: WorkHandler,
    ) -> Result<(), QueueError> {
        let mut ticker = time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let lease = loop {
            let candidate = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = self.closed.cancelled() => return Err(QueueError::Closed),
                Some(item) = self.recv_handoff() => item,
                _ = ticker.tick() => match self.poll().await {
                    Some(item) => item,
                    None => continue,
                },
            };

            if let Some(lease) = self.acquire(&candidate).await {
                break lease;
            }
        };

        self.execute(cancel, lease, handler).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryLeaseBackend;
    use durable_core::JobError;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> QueueConfig {
        QueueConfig::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_lease_duration(Duration::from_millis(200))
    }

    fn counting_handler(
        count: Arc<AtomicUsize>,
        hold: Duration,
        result: fn() -> Result<(), JobError>,
    ) -> WorkHandler {
        Box::new(move |_item| {
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                result()
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_local_handoff_skips_polling() {
        // Polling alone would take ten seconds.
        let config = QueueConfig::new()
            .with_poll_interval(Duration::from_secs(10))
            .with_heartbeat_interval(Duration::from_secs(1));
        let queue = Arc::new(LeaseQueue::new(InMemoryLeaseBackend::new(), config).unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let worker = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            let handler = counting_handler(count.clone(), Duration::ZERO, || Ok(()));
            tokio::spawn(async move { queue.run_next(&cancel, handler).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.schedule("job-1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("handoff should wake the waiting worker")
            .unwrap()
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(queue.backend().is_empty());
    }

    #[tokio::test]
    async fn test_lease_exclusivity_with_heartbeat() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let first = Arc::new(LeaseQueue::with_backend(backend.clone(), fast_config()).unwrap());
        let second = Arc::new(LeaseQueue::with_backend(backend.clone(), fast_config()).unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        first.schedule("job-1").await.unwrap();

        // The handler outlives the lease several times over; only heartbeats keep it.
        let hold = Duration::from_millis(600);
        let workers: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .map(|queue| {
                let cancel = cancel.clone();
                let handler = counting_handler(count.clone(), hold, || Ok(()));
                tokio::spawn(async move { queue.run_next(&cancel, handler).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(900)).await;
        cancel.cancel();

        let mut completed = 0;
        for worker in workers {
            match worker.await.unwrap() {
                Ok(()) => completed += 1,
                Err(QueueError::Cancelled) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_item_leased() {
        let queue = LeaseQueue::new(InMemoryLeaseBackend::new(), fast_config()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        queue.schedule("job-1").await.unwrap();

        let handler = counting_handler(count.clone(), Duration::ZERO, || {
            Err(JobError::transient(anyhow::anyhow!("try later")))
        });
        let err = queue.run_next(&cancel, handler).await.unwrap_err();
        assert!(matches!(err, QueueError::Handler { ref job_id, .. } if job_id == "job-1"));

        let item = queue.backend().get("job-1").await.unwrap().unwrap();
        assert_eq!(item.attempt_count, 1);
        assert!(!item.is_runnable(Utc::now()));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_after_lease_expiry() {
        let queue = LeaseQueue::new(InMemoryLeaseBackend::new(), fast_config()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        queue.schedule("job-1").await.unwrap();

        let failing = counting_handler(count.clone(), Duration::ZERO, || {
            Err(JobError::transient(anyhow::anyhow!("try later")))
        });
        assert!(queue.run_next(&cancel, failing).await.is_err());

        let succeeding = counting_handler(count.clone(), Duration::ZERO, || Ok(()));
        tokio::time::timeout(Duration::from_secs(2), queue.run_next(&cancel, succeeding))
            .await
            .expect("item should become runnable when the lease expires")
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(queue.backend().is_empty());
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_acknowledges() {
        let queue = LeaseQueue::new(InMemoryLeaseBackend::new(), fast_config()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        queue.schedule("job-1").await.unwrap();

        let handler = counting_handler(count.clone(), Duration::ZERO, || {
            Err(JobError::unrecoverable(anyhow::anyhow!("never")))
        });
        assert!(queue.run_next(&cancel, handler).await.is_err());
        assert!(queue.backend().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_waits_for_handler_and_releases_lease() {
        let queue = Arc::new(LeaseQueue::new(InMemoryLeaseBackend::new(), fast_config()).unwrap());
        let finished = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        queue.schedule("job-1").await.unwrap();

        let worker = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            let observed = cancel.clone();
            let finished = finished.clone();
            let handler: WorkHandler = Box::new(move |_item| {
                async move {
                    observed.cancelled().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::Cancelled)
                }
                .boxed()
            });
            tokio::spawn(async move { queue.run_next(&cancel, handler).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(matches!(worker.await.unwrap(), Err(QueueError::Cancelled)));
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let item = queue.backend().get("job-1").await.unwrap().unwrap();
        assert_eq!(item.attempt_count, 1);
        assert!(item.is_runnable(Utc::now()));
    }

    #[tokio::test]
    async fn test_success_after_cancel_is_acknowledged() {
        let queue = LeaseQueue::new(InMemoryLeaseBackend::new(), fast_config()).unwrap();
        let cancel = CancellationToken::new();
        queue.schedule("job-1").await.unwrap();

        let trigger = cancel.clone();
        let handler: WorkHandler = Box::new(move |_item| {
            async move {
                trigger.cancel();
                Ok(())
            }
            .boxed()
        });
        queue.run_next(&cancel, handler).await.unwrap();
        assert!(queue.backend().is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let queue = LeaseQueue::new(InMemoryLeaseBackend::new(), fast_config()).unwrap();
        queue.close().await.unwrap();

        let cancel = CancellationToken::new();
        let handler = counting_handler(Arc::new(AtomicUsize::new(0)), Duration::ZERO, || Ok(()));
        assert!(matches!(
            queue.run_next(&cancel, handler).await,
            Err(QueueError::Closed)
        ));
        assert!(matches!(
            queue.schedule("job-1").await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_schedule() {
        let queue = LeaseQueue::new(InMemoryLeaseBackend::new(), fast_config()).unwrap();
        queue.schedule("job-1").await.unwrap();
        assert!(matches!(
            queue.schedule("job-1").await,
            Err(QueueError::Duplicate(_))
        ));
    }
}
