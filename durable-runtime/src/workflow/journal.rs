//! Per-attempt bookkeeping shared by every scope of one workflow job.

use super::job::{JobState, WORKFLOW_JOB_TYPE};
use super::tree::StageNode;
use crate::backoff::RetryPolicy;
use durable_core::codec::{Encoder, Envelope, JsonCodec};
use durable_core::{JobRuntime, SnapshotOptions, StoreError};
use std::sync::{Mutex, MutexGuard};

/// Cached output lookup for a positional stage.
pub(crate) enum Entry {
    Cached(Vec<u8>),
    Fresh,
}

/// Owns the stage tree for the duration of one attempt and persists it.
///
/// Locks are never held across an await.
pub struct Journal<'a> {
    runtime: &'a dyn JobRuntime,
    name: String,
    attempt_count: u64,
    retry: RetryPolicy,
    tree: Mutex<StageNode>,
    workflow: Mutex<Envelope>,
}

impl<'a> Journal<'a> {
    pub(crate) fn new(
        runtime: &'a dyn JobRuntime,
        name: String,
        attempt_count: u64,
        retry: RetryPolicy,
        tree: StageNode,
        workflow: Envelope,
    ) -> Self {
        Self {
            runtime,
            name,
            attempt_count,
            retry,
            tree: Mutex::new(tree),
            workflow: Mutex::new(workflow),
        }
    }

    pub(crate) fn runtime(&self) -> &'a dyn JobRuntime {
        self.runtime
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    fn tree(&self) -> MutexGuard<'_, StageNode> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn into_tree(self) -> StageNode {
        self.tree
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Visit the child at `index` under `parent`, creating it on first visit.
    pub(crate) fn enter(&self, parent: &[usize], index: usize, name: &str) -> Entry {
        let mut tree = self.tree();
        let Some(parent_node) = tree.node_mut(parent) else {
            tracing::warn!(
                job_id = %self.runtime.id(),
                parent = ?parent,
                position = index,
                stage = %name,
                "No recorded scope at this path, stage will not be memoized"
            );
            return Entry::Fresh;
        };

        if let Some(node) = parent_node.children.get(index) {
            if node.name != name {
                tracing::warn!(
                    job_id = %self.runtime.id(),
                    position = index,
                    recorded = %node.name,
                    requested = %name,
                    "Stage name differs from the recorded one at this position"
                );
            }
            return match &node.output {
                Some(output) => Entry::Cached(output.clone()),
                None => Entry::Fresh,
            };
        }

        while parent_node.children.len() < index {
            let filler = format!("stage-{:02}", parent_node.children.len() + 1);
            parent_node.children.push(StageNode::new(filler));
        }
        parent_node.children.push(StageNode::new(name));
        Entry::Fresh
    }

    pub(crate) fn is_committed(&self, path: &[usize]) -> bool {
        self.tree()
            .node(path)
            .is_some_and(StageNode::is_committed)
    }

    pub(crate) fn store_output(&self, path: &[usize], output: Vec<u8>) {
        if let Some(node) = self.tree().node_mut(path) {
            node.output = Some(output);
        }
    }

    /// Forget everything recorded below `path`.
    pub(crate) fn discard_children(&self, path: &[usize]) {
        if let Some(node) = self.tree().node_mut(path) {
            node.children.clear();
        }
    }

    pub(crate) fn set_workflow(&self, workflow: Envelope) {
        *self.workflow.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = workflow;
    }

    /// Append a snapshot holding the whole job as it stands.
    pub(crate) async fn commit(&self, description: &str) -> Result<(), StoreError> {
        let state = JobState {
            name: self.name.clone(),
            attempt_count: self.attempt_count,
            retry: self.retry.clone(),
            workflow: self
                .workflow
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            root: self.tree().clone(),
        };
        let payload = JsonCodec.encode(&state)?;
        let bytes = Envelope::new(WORKFLOW_JOB_TYPE, payload.to_vec()).to_bytes()?;
        self.runtime
            .update(bytes, SnapshotOptions::new().with_description(description))
            .await?;
        tracing::trace!(
            job_id = %self.runtime.id(),
            stage = %description,
            "Committed workflow progress"
        );
        Ok(())
    }
}
