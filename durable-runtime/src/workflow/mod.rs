//! Memoizing saga workflows.
//!
//! A workflow body is a sequence of stages. Each stage's output is committed
//! to a persisted tree keyed by position before the next stage starts, so a
//! retried or resumed body replays committed stages from cache and only
//! executes what never finished.
//!
//! # Failure handling
//!
//! Failures are plain `Err(Failure)` values carried up with `?`:
//!
//! - A transient failure retries the enclosing scope with exponential backoff.
//! - An unrecoverable failure runs the scope's rollback handlers newest first
//!   and propagates to the parent, which does the same.
//! - A stage marked [`StageOptions::rollback_on_failure`] compensates every
//!   enclosing scope and restarts the root from scratch.
//! - Storage errors and cancellation end the attempt immediately; the job is
//!   resumed later from its last snapshot.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut workflows = WorkflowRegistry::new();
//! workflows.register_workflow::<Transfer>();
//!
//! let mut registry = RunnableRegistry::new();
//! WorkflowJob::install(&mut registry, Arc::new(workflows));
//!
//! let scheduler = Scheduler::new(store, queue, registry);
//! scheduler.enqueue(&WorkflowJob::new(Transfer { amount: 10 }), &[]).await?;
//! ```

mod failure;
mod job;
mod journal;
mod runtime;
mod saga;
mod tree;

pub use failure::{Failure, StageResult};
pub use job::{
    ErasedWorkflow, RegisterWorkflow, Workflow, WorkflowJob, WorkflowRegistry, WORKFLOW_JOB_TYPE,
};
pub use runtime::{RollbackFn, Runtime, StageOptions};
pub use saga::{at_most_once, two_phase_commit};
pub use tree::StageNode;
