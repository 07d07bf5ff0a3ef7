//! Workflow traits and the runnable wrapping a root workflow.

use super::failure::{Failure, StageResult};
use super::journal::Journal;
use super::runtime::Runtime;
use super::tree::StageNode;
use crate::backoff::RetryPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use durable_core::codec::{Decoder, Encoder, Envelope, JsonCodec, ENVELOPE_VERSION};
use durable_core::{
    CodecError, Durable, JobError, JobRuntime, Runnable, RunnableRegistry, TypeRegistry,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tracing::Instrument;

/// Type name every workflow job is stored under.
pub const WORKFLOW_JOB_TYPE: &str = "workflow";

/// A body of stages with its own rollback scope.
///
/// The body runs from the top on every retry. Stages that committed on an
/// earlier run return their cached output instead of executing again, so
/// everything outside a stage must be cheap and side-effect free.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize, Durable)]
/// struct Transfer { amount: u64 }
///
/// #[async_trait]
/// impl Workflow for Transfer {
///     type Output = ();
///
///     async fn run(rt: &mut Runtime<'_, Self>) -> StageResult<()> {
///         let hold: String = rt
///             .stage("hold", |w| async move { bank::hold(w.amount).await }.boxed())
///             .await?;
///         let release = hold.clone();
///         rt.on_rollback(move |_| async move { bank::release(&release).await }.boxed());
///         rt.stage("settle", move |_| async move { bank::settle(&hold).await }.boxed())
///             .await
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sized + 'static {
    type Output: Send;

    async fn run(rt: &mut Runtime<'_, Self>) -> StageResult<Self::Output>;
}

/// Object-safe view of a root workflow, stored inside a [`WorkflowJob`].
///
/// Implemented for every `Workflow + Durable` type.
pub trait ErasedWorkflow: Send + Sync + 'static {
    fn type_name(&self) -> &'static str;

    fn encode(&self) -> Result<Bytes, CodecError>;

    fn as_any(&self) -> &dyn Any;

    #[doc(hidden)]
    fn drive<'a>(&'a mut self, journal: &'a Journal<'a>) -> BoxFuture<'a, StageResult<()>>;
}

impl<W> ErasedWorkflow for W
where
    W: Workflow + Durable,
{
    fn type_name(&self) -> &'static str {
        W::TYPE_NAME
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        JsonCodec.encode(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn drive<'a>(&'a mut self, journal: &'a Journal<'a>) -> BoxFuture<'a, StageResult<()>> {
        async move {
            let mut rt = Runtime::root(self, journal);
            rt.drive().await.map(|_| ())
        }
        .boxed()
    }
}

/// Registry of root workflow types.
pub type WorkflowRegistry = TypeRegistry<dyn ErasedWorkflow>;

/// Registration of workflow types by their `TYPE_NAME`.
pub trait RegisterWorkflow {
    fn register_workflow<W>(&mut self) -> &mut Self
    where
        W: Workflow + Durable;
}

impl RegisterWorkflow for WorkflowRegistry {
    fn register_workflow<W>(&mut self) -> &mut Self
    where
        W: Workflow + Durable,
    {
        self.register_with(W::TYPE_NAME, |payload| {
            let workflow: W = JsonCodec.decode(payload)?;
            Ok(Box::new(workflow) as Box<dyn ErasedWorkflow>)
        })
    }
}

/// Persisted form of a [`WorkflowJob`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobState {
    pub name: String,
    #[serde(default)]
    pub attempt_count: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub workflow: Envelope,
    #[serde(default)]
    pub root: StageNode,
}

/// Runnable that executes a root workflow and memoizes its stage tree.
pub struct WorkflowJob {
    name: String,
    attempt_count: u64,
    retry: RetryPolicy,
    workflow: Box<dyn ErasedWorkflow>,
    root: StageNode,
}

impl std::fmt::Debug for WorkflowJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowJob")
            .field("name", &self.name)
            .field("workflow", &self.workflow.type_name())
            .field("attempt_count", &self.attempt_count)
            .finish_non_exhaustive()
    }
}

impl WorkflowJob {
    /// Wrap `workflow`, named after its type.
    pub fn new<W>(workflow: W) -> Self
    where
        W: Workflow + Durable,
    {
        Self {
            name: W::TYPE_NAME.to_string(),
            attempt_count: 0,
            retry: RetryPolicy::default(),
            root: StageNode::new(W::TYPE_NAME),
            workflow: Box::new(workflow),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.root.name = self.name.clone();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of times the job runtime has run this job.
    pub fn attempt_count(&self) -> u64 {
        self.attempt_count
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Stage tree recorded so far.
    pub fn root(&self) -> &StageNode {
        &self.root
    }

    /// The wrapped workflow, if it is a `W`.
    pub fn workflow<W: 'static>(&self) -> Option<&W> {
        self.workflow.as_any().downcast_ref::<W>()
    }

    /// Encoded state of the wrapped workflow.
    pub fn workflow_state(&self) -> Result<Bytes, CodecError> {
        self.workflow.encode()
    }

    /// Decode a job from snapshot state.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the blob is not a workflow job or names a
    /// workflow type missing from `workflows`.
    pub fn decode(bytes: &[u8], workflows: &WorkflowRegistry) -> Result<Self, CodecError> {
        let envelope = Envelope::from_bytes(bytes)?;
        if envelope.type_name != WORKFLOW_JOB_TYPE {
            return Err(CodecError::UnknownType(envelope.type_name));
        }
        Self::from_payload(&envelope.payload, workflows)
    }

    fn from_payload(payload: &[u8], workflows: &WorkflowRegistry) -> Result<Self, CodecError> {
        let state: JobState = JsonCodec.decode(payload)?;
        if state.workflow.version != ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion {
                expected: ENVELOPE_VERSION,
                found: state.workflow.version,
            });
        }
        let workflow =
            workflows.decode_payload(&state.workflow.type_name, &state.workflow.payload)?;
        Ok(Self {
            name: state.name,
            attempt_count: state.attempt_count,
            retry: state.retry,
            workflow,
            root: state.root,
        })
    }

    /// Make workflow jobs decodable by the job runtime.
    pub fn install(registry: &mut RunnableRegistry, workflows: Arc<WorkflowRegistry>) {
        registry.register_with(WORKFLOW_JOB_TYPE, move |payload| {
            let job = WorkflowJob::from_payload(payload, &workflows)?;
            Ok(Box::new(job) as Box<dyn Runnable>)
        });
    }

    fn workflow_envelope(&self) -> Result<Envelope, CodecError> {
        Ok(Envelope::new(
            self.workflow.type_name(),
            self.workflow.encode()?.to_vec(),
        ))
    }
}

#[async_trait]
impl Runnable for WorkflowJob {
    fn type_name(&self) -> &'static str {
        WORKFLOW_JOB_TYPE
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        let state = JobState {
            name: self.name.clone(),
            attempt_count: self.attempt_count,
            retry: self.retry.clone(),
            workflow: self.workflow_envelope()?,
            root: self.root.clone(),
        };
        JsonCodec.encode(&state)
    }

    async fn run(&mut self, rt: &dyn JobRuntime) -> Result<(), JobError> {
        self.attempt_count += 1;
        let span = tracing::info_span!(
            "workflow",
            job_id = %rt.id(),
            name = %self.name,
            attempt = self.attempt_count
        );

        let journal = Journal::new(
            rt,
            self.name.clone(),
            self.attempt_count,
            self.retry.clone(),
            std::mem::take(&mut self.root),
            self.workflow_envelope()?,
        );
        let result = self.workflow.drive(&journal).instrument(span).await;
        self.root = journal.into_tree();

        result.map_err(Failure::into_error)
    }
}
