//! In-process harness for running workflows end to end.
//!
//! ```rust,ignore
//! let mut workflows = WorkflowRegistry::new();
//! workflows.register_workflow::<Counter>();
//!
//! let harness = Harness::new(workflows, Harness::fast_config())?;
//! let (snapshot, job) = harness.run(harness.job(Counter { delta: 1 })).await?;
//! assert!(snapshot.result().is_ok());
//! harness.close().await?;
//! ```

use crate::backoff::RetryPolicy;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::scheduler::Scheduler;
use crate::workflow::{Workflow, WorkflowJob, WorkflowRegistry};
use durable_core::{Durable, RunnableRegistry, Snapshot};
use durable_persistence::{InMemoryLeaseBackend, InMemoryStore, LeaseQueue, QueueConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber filtered by `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory store, lease queue and worker loops behind one scheduler.
pub struct Harness {
    workflows: Arc<WorkflowRegistry>,
    scheduler: Scheduler,
    config: RuntimeConfig,
    cancel: CancellationToken,
}

impl Harness {
    /// Short intervals and a small, jitter-free retry budget.
    pub fn fast_config() -> RuntimeConfig {
        RuntimeConfig::default()
            .with_queue(
                QueueConfig::new()
                    .with_poll_interval(Duration::from_millis(10))
                    .with_heartbeat_interval(Duration::from_millis(50)),
            )
            .with_retry(
                RetryPolicy::constant(Duration::from_millis(5))
                    .with_max_elapsed(Some(Duration::from_secs(5))),
            )
            .with_workers(2)
    }

    /// Build the harness and start its worker loops.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(workflows: WorkflowRegistry, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let workflows = Arc::new(workflows);

        let mut registry = RunnableRegistry::new();
        WorkflowJob::install(&mut registry, workflows.clone());

        let store = InMemoryStore::new().with_poll_interval(config.wait_poll_interval());
        let queue = LeaseQueue::new(InMemoryLeaseBackend::new(), config.queue.clone())?;
        let scheduler = Scheduler::new(Arc::new(store), Arc::new(queue), registry);

        let cancel = CancellationToken::new();
        scheduler.spawn_workers(config.workers, &cancel);

        Ok(Self {
            workflows,
            scheduler,
            config,
            cancel,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Wrap `workflow` with the configured retry policy.
    pub fn job<W>(&self, workflow: W) -> WorkflowJob
    where
        W: Workflow + Durable,
    {
        WorkflowJob::new(workflow).with_retry(self.config.retry.clone())
    }

    /// Enqueue `job`, wait for its final snapshot and decode the job from it.
    pub async fn run(&self, job: WorkflowJob) -> Result<(Snapshot, WorkflowJob), RuntimeError> {
        let record = self.scheduler.enqueue(&job, &[]).await?;
        let snapshot = self
            .scheduler
            .wait_for_completion(&self.cancel, record.as_ref())
            .await?;
        let job = WorkflowJob::decode(&snapshot.state, &self.workflows)?;
        Ok((snapshot, job))
    }

    /// Run two fresh jobs built by `make` and compare their final workflow
    /// state, stage tree and error.
    pub async fn check_determinism<F>(&self, make: F) -> anyhow::Result<()>
    where
        F: Fn() -> WorkflowJob,
    {
        let (first, first_job) = self.run(make()).await?;
        let (second, second_job) = self.run(make()).await?;

        if first.error != second.error {
            anyhow::bail!(
                "final errors differ: {:?} vs {:?}",
                first.error,
                second.error
            );
        }
        if first_job.root() != second_job.root() {
            anyhow::bail!(
                "stage trees differ:\n{:#?}\nvs\n{:#?}",
                first_job.root(),
                second_job.root()
            );
        }
        let (a, b) = (first_job.workflow_state()?, second_job.workflow_state()?);
        if a != b {
            anyhow::bail!(
                "workflow states differ: {} vs {}",
                String::from_utf8_lossy(&a),
                String::from_utf8_lossy(&b)
            );
        }
        Ok(())
    }

    /// Stop the worker loops and close the scheduler.
    pub async fn close(self) -> Result<(), RuntimeError> {
        self.cancel.cancel();
        self.scheduler.close().await
    }
}
