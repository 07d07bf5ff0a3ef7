//! Execution handle passed to a workflow body, and the scope driver.

use super::failure::{Failure, StageResult};
use super::job::Workflow;
use super::journal::{Entry, Journal};
use durable_core::codec::{Decoder, Encoder, Envelope, JsonCodec};
use durable_core::{CodecError, Durable};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Compensation registered with [`Runtime::on_rollback`].
pub type RollbackFn<W> =
    Box<dyn for<'x> FnOnce(&'x mut W) -> BoxFuture<'x, StageResult<()>> + Send>;

type SyncFn<W> = fn(&W) -> Result<Envelope, CodecError>;

/// Options for [`Runtime::stage`] and [`Runtime::embed`].
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub name: Option<String>,
    /// On failure, compensate every enclosing scope instead of retrying this one.
    pub rollback_on_failure: bool,
}

impl StageOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            rollback_on_failure: false,
        }
    }

    /// Unnamed stage, named `stage-NN` after its position.
    pub fn unnamed() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rollback_on_failure(mut self) -> Self {
        self.rollback_on_failure = true;
        self
    }
}

impl From<&str> for StageOptions {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StageOptions {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Handle for one scope of a running workflow.
///
/// Every scope owns its workflow value, a cursor over its positional
/// children and a stack of rollback handlers. Only the stage tree and the
/// root workflow value outlive an attempt.
pub struct Runtime<'a, W> {
    workflow: &'a mut W,
    journal: &'a Journal<'a>,
    path: Vec<usize>,
    name: String,
    cursor: usize,
    full_rollback: bool,
    rollbacks: Vec<RollbackFn<W>>,
    sync_state: Option<SyncFn<W>>,
    span: tracing::Span,
}

fn encode_workflow<W: Durable>(workflow: &W) -> Result<Envelope, CodecError> {
    Ok(Envelope::new(W::TYPE_NAME, JsonCodec.encode(workflow)?.to_vec()))
}

fn stage_name(options: &StageOptions, index: usize) -> String {
    options
        .name
        .clone()
        .unwrap_or_else(|| format!("stage-{:02}", index + 1))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Run `rollbacks` newest first. The first handler that fails or panics stops
/// compensation with an unrecoverable failure.
async fn revert<W: Send>(workflow: &mut W, rollbacks: Vec<RollbackFn<W>>) -> StageResult<()> {
    tracing::debug!(handlers = rollbacks.len(), "Rolling back scope");
    for rollback in rollbacks.into_iter().rev() {
        match AssertUnwindSafe(rollback(workflow)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => {
                tracing::error!(error = %failure, "Rollback handler failed");
                return Err(failure.escalate());
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(panic = %message, "Rollback handler panicked");
                return Err(Failure::internal(message).escalate());
            }
        }
    }
    Ok(())
}

impl<'a, W> Runtime<'a, W>
where
    W: Send + 'static,
{
    pub(crate) fn root(workflow: &'a mut W, journal: &'a Journal<'a>) -> Self
    where
        W: Durable,
    {
        Self {
            workflow,
            journal,
            path: Vec::new(),
            name: journal.name().to_string(),
            cursor: 0,
            full_rollback: false,
            rollbacks: Vec::new(),
            sync_state: Some(encode_workflow::<W>),
            span: tracing::Span::current(),
        }
    }

    /// Job id.
    pub fn id(&self) -> &str {
        self.journal.runtime().id()
    }

    /// Cancelled when the attempt should stop.
    pub fn cancellation(&self) -> &CancellationToken {
        self.journal.runtime().cancellation()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Slash-separated path of this scope.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workflow(&self) -> &W {
        &*self.workflow
    }

    /// Mutable workflow state.
    ///
    /// Changes to a root workflow are persisted with the next stage commit.
    pub fn workflow_mut(&mut self) -> &mut W {
        &mut *self.workflow
    }

    /// Whether the next stage already committed on an earlier run.
    pub fn next_stage_cached(&self) -> bool {
        self.journal.is_committed(&self.child_path(self.cursor))
    }

    fn child_path(&self, index: usize) -> Vec<usize> {
        let mut path = self.path.clone();
        path.push(index);
        path
    }

    fn child_name(&self, name: &str) -> String {
        format!("{}/{}", self.name, name)
    }

    fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    fn sync_workflow(&self) -> StageResult<()> {
        if let Some(encode) = self.sync_state {
            let envelope = encode(&*self.workflow).map_err(Failure::unrecoverable)?;
            self.journal.set_workflow(envelope);
        }
        Ok(())
    }

    /// Run `f` as the next stage, or return its cached output.
    ///
    /// A fresh output is encoded into the stage tree and the whole job is
    /// persisted before this returns. On replay `f` is not called at all.
    ///
    /// # Errors
    ///
    /// Returns the stage's own failure, or an unrecoverable failure if a
    /// cached output no longer decodes.
    pub async fn stage<T, F>(&mut self, options: impl Into<StageOptions>, f: F) -> StageResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'x> FnOnce(&'x mut W) -> BoxFuture<'x, StageResult<T>> + Send,
    {
        let options = options.into();
        let index = self.cursor;
        self.cursor += 1;
        let name = stage_name(&options, index);
        let stage = self.child_name(&name);

        if let Entry::Cached(bytes) = self.journal.enter(&self.path, index, &name) {
            tracing::debug!(stage = %stage, "Stage cache reused");
            return JsonCodec.decode(&bytes).map_err(|e: CodecError| {
                Failure::unrecoverable(anyhow::Error::new(e).context(format!(
                    "cached output of stage {} does not decode",
                    stage
                )))
            });
        }

        tracing::debug!(stage = %stage, "Beginning stage");
        let output = match f(&mut *self.workflow).await {
            Ok(output) => output,
            Err(failure) => {
                tracing::warn!(stage = %stage, error = %failure, "Stage failed");
                return Err(if options.rollback_on_failure {
                    failure.with_rollback_all()
                } else {
                    failure
                });
            }
        };

        let bytes = JsonCodec.encode(&output).map_err(Failure::unrecoverable)?;
        self.journal
            .store_output(&self.child_path(index), bytes.to_vec());
        self.sync_workflow()?;
        self.journal.commit(&stage).await?;
        tracing::debug!(stage = %stage, "Stage results stored");
        Ok(output)
    }

    /// Run `sub` as a nested scope with its own retries and rollback stack.
    ///
    /// The nested body runs on every visit; its stages replay from cache.
    /// Once it succeeds, its remaining rollback handlers become a single
    /// handler of this scope. A failure it could not resolve is returned
    /// here to propagate further.
    pub async fn embed<S>(
        &mut self,
        options: impl Into<StageOptions>,
        mut sub: S,
    ) -> StageResult<S::Output>
    where
        S: Workflow,
    {
        let options = options.into();
        let index = self.cursor;
        self.cursor += 1;
        let name = stage_name(&options, index);
        let scope = self.child_name(&name);

        self.journal.enter(&self.path, index, &name);
        self.sync_workflow()?;

        let span = tracing::info_span!(parent: &self.span, "scope", name = %scope);
        let mut child = Runtime {
            workflow: &mut sub,
            journal: self.journal,
            path: self.child_path(index),
            name: scope,
            cursor: 0,
            full_rollback: self.full_rollback || options.rollback_on_failure,
            rollbacks: Vec::new(),
            sync_state: None,
            span: span.clone(),
        };
        let result = child.drive().instrument(span).await;
        let Runtime {
            rollbacks, name, ..
        } = child;

        let output = match result {
            Ok(output) => output,
            Err(failure) => {
                tracing::error!(scope = %name, error = %failure, "Embedded workflow failed");
                return Err(failure);
            }
        };

        if !rollbacks.is_empty() {
            self.on_rollback(move |_| async move { revert(&mut sub, rollbacks).await }.boxed());
        }
        Ok(output)
    }

    /// Register compensation for work done so far in this scope.
    ///
    /// Handlers run newest first when the scope fails unrecoverably or is
    /// rolled back as a whole. A handler that fails makes the failure
    /// unrecoverable.
    pub fn on_rollback<F>(&mut self, f: F)
    where
        F: for<'x> FnOnce(&'x mut W) -> BoxFuture<'x, StageResult<()>> + Send + 'static,
    {
        tracing::debug!(scope = %self.name, "Adding rollback function");
        self.rollbacks.push(Box::new(f));
    }

    /// Build the failure that aborts this body. Return it with `Err(...)`.
    pub fn fail(&self, err: impl Into<Failure>) -> Failure {
        let failure = err.into();
        tracing::warn!(scope = %self.name, error = %failure, "Workflow failed");
        failure
    }

    /// Run the body until it succeeds, fails for good, or runs out of retries.
    pub(crate) async fn drive(&mut self) -> StageResult<W::Output>
    where
        W: Workflow,
    {
        let mut backoff = self.journal.retry().backoff();
        loop {
            self.cursor = 0;
            self.rollbacks.clear();
            if self.cancellation().is_cancelled() {
                return Err(Failure::cancelled());
            }

            let result = match AssertUnwindSafe(W::run(self)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(Failure::internal(panic_message(&*panic))),
            };

            let mut failure = match result {
                Ok(output) => {
                    self.sync_workflow()?;
                    self.journal.commit(&self.name).await?;
                    return Ok(output);
                }
                Err(failure) => failure,
            };

            if failure.is_abort() {
                return Err(failure);
            }
            if self.full_rollback {
                failure.rollback_all = true;
            }
            tracing::warn!(scope = %self.name, error = %failure, "Workflow run failed");

            if failure.is_unrecoverable() || failure.rollback_all {
                let rollbacks = std::mem::take(&mut self.rollbacks);
                if let Err(escalated) = revert(&mut *self.workflow, rollbacks).await {
                    failure = escalated;
                }
                if !failure.is_unrecoverable() {
                    // Compensated stages must run again rather than replay.
                    self.journal.discard_children(&self.path);
                    self.sync_workflow()?;
                    self.journal.commit(&self.name).await?;
                }
            }

            if failure.is_unrecoverable() {
                tracing::error!(scope = %self.name, error = %failure, "Unrecoverable error");
                return Err(failure);
            }
            if failure.rollback_all && !self.is_root() {
                return Err(failure);
            }

            let Some(delay) = backoff.next_delay() else {
                tracing::warn!(
                    scope = %self.name,
                    retries = backoff.retries(),
                    "Retry budget exhausted"
                );
                return Err(failure);
            };
            tracing::debug!(scope = %self.name, delay = ?delay, "Retrying scope");
            tokio::select! {
                _ = self.cancellation().cancelled() => return Err(Failure::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
