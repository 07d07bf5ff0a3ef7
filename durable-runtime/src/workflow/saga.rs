//! Reusable compensation patterns built from embedded workflows.

use super::failure::{Failure, StageResult};
use super::job::Workflow;
use super::runtime::{Runtime, StageOptions};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

type Reserve<T> = Arc<dyn Fn() -> BoxFuture<'static, StageResult<T>> + Send + Sync>;
type Action<T> = Arc<dyn Fn(T) -> BoxFuture<'static, StageResult<()>> + Send + Sync>;

struct TwoPhaseCommit<T> {
    reserve: Reserve<T>,
    commit: Action<T>,
    release: Action<T>,
    committed: bool,
}

#[async_trait]
impl<T> Workflow for TwoPhaseCommit<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Output = T;

    async fn run(rt: &mut Runtime<'_, Self>) -> StageResult<T> {
        let id: T = rt.stage("reserve", |w| (w.reserve)()).await?;

        let reserved = id.clone();
        rt.on_rollback(move |w| {
            async move {
                if w.committed {
                    return Ok(());
                }
                let release = w.release.clone();
                release(reserved).await
            }
            .boxed()
        });

        let committing = id.clone();
        rt.stage("commit", move |w| (w.commit)(committing)).await?;
        rt.workflow_mut().committed = true;
        Ok(id)
    }
}

/// Reserve a resource, then commit it, releasing it if the commit never lands.
///
/// `reserve` runs as a cached stage, so a resource is reserved at most once
/// per committed attempt. `commit` is retried with backoff and must be
/// idempotent. If this scope or an enclosing one is rolled back before
/// `commit` succeeded, `release` runs with the reserved id.
///
/// A crash between reserving and committing the `reserve` stage can leak a
/// reservation; pair this with out-of-band cleanup of stale reservations.
pub async fn two_phase_commit<W, T, R, C, L>(
    rt: &mut Runtime<'_, W>,
    options: impl Into<StageOptions>,
    reserve: R,
    commit: C,
    release: L,
) -> StageResult<T>
where
    W: Send + 'static,
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    R: Fn() -> BoxFuture<'static, StageResult<T>> + Send + Sync + 'static,
    C: Fn(T) -> BoxFuture<'static, StageResult<()>> + Send + Sync + 'static,
    L: Fn(T) -> BoxFuture<'static, StageResult<()>> + Send + Sync + 'static,
{
    rt.embed(
        options,
        TwoPhaseCommit {
            reserve: Arc::new(reserve),
            commit: Arc::new(commit),
            release: Arc::new(release),
            committed: false,
        },
    )
    .await
}

type Apply<T> = Box<dyn FnOnce() -> BoxFuture<'static, StageResult<T>> + Send>;

struct AtMostOnce<T> {
    apply: Option<Apply<T>>,
    fresh: bool,
}

#[async_trait]
impl<T> Workflow for AtMostOnce<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Output = T;

    async fn run(rt: &mut Runtime<'_, Self>) -> StageResult<T> {
        rt.stage("limit", |w| {
            w.fresh = true;
            async { Ok(()) }.boxed()
        })
        .await?;

        // A committed limit without a committed apply means an earlier
        // attempt may have run the action.
        if !rt.workflow().fresh && !rt.next_stage_cached() {
            return Err(rt.fail(Failure::unrecoverable(anyhow::anyhow!(
                "{}: cannot retry an at-most-once action",
                rt.name()
            ))));
        }

        rt.on_rollback(|_| {
            async {
                Err(Failure::unrecoverable(anyhow::anyhow!(
                    "cannot retry an at-most-once action"
                )))
            }
            .boxed()
        });

        rt.stage(StageOptions::new("apply").rollback_on_failure(), |w| {
            match w.apply.take() {
                Some(apply) => apply(),
                None => async { Err(Failure::internal("at-most-once action already consumed")) }
                    .boxed(),
            }
        })
        .await
    }
}

/// Run `f` at most once across every attempt of the job.
///
/// A `limit` marker is committed before `f` runs. If a later attempt finds
/// the marker without `f`'s committed output, it fails unrecoverably instead
/// of running `f` again. A failure of `f` itself is unrecoverable as well.
pub async fn at_most_once<W, T, F>(
    rt: &mut Runtime<'_, W>,
    options: impl Into<StageOptions>,
    f: F,
) -> StageResult<T>
where
    W: Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> BoxFuture<'static, StageResult<T>> + Send + 'static,
{
    rt.embed(
        options,
        AtMostOnce {
            apply: Some(Box::new(f)),
            fresh: false,
        },
    )
    .await
}
