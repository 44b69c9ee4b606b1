//! Steps shared by the workflow sagas.
//!
//! Begin, commit and abort on the registry and repo aggregates are
//! unconditional: they are sent on every entry to their state and their
//! refusals are classified here, next to the call.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fso_core::WorkflowSettings;
use fso_events::{EntityId, View, Vid};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::activity::ActivityContext;
use crate::classify::{ClientError, is_fatal_begin, is_nothing_pending, is_version_conflict};
use crate::clients::{
    RegistryClient, RepoOp, ReposClient, Status, ToolError, WorkflowClient, WorkflowCommand,
};
use crate::error::ActivityError;
use crate::workflow::Step;

/// Registry and repository a repo-level workflow operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoTarget {
    pub registry: EntityId,
    pub repo: EntityId,
}

/// Clients of the registry and repo aggregates.
#[derive(Clone)]
pub struct Aggregates {
    pub registry: Arc<dyn RegistryClient>,
    pub repos: Arc<dyn ReposClient>,
}

/// Outcome of a multi-aggregate begin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Begin {
    Begun,
    /// An aggregate refused for good; compensate with this status.
    Refused(Status),
}

fn refused_or_retry(aggregate: &str, op: RepoOp, err: ClientError) -> Result<Begin, ActivityError> {
    if is_fatal_begin(&err) {
        warn!(aggregate, op = %op, error = %err, "Begin refused");
        let status = Status::new(
            Status::BEGIN_REFUSED,
            format!("{aggregate} refused {op}: {}", err.message),
        );
        Ok(Begin::Refused(status))
    } else {
        Err(ActivityError::from(err))
    }
}

fn tolerate_nothing_pending(
    aggregate: &str,
    action: &str,
    result: Result<Vid, ClientError>,
) -> Result<(), ActivityError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_nothing_pending(&err) => {
            debug!(aggregate, action, error = %err, "Nothing pending; treating as done");
            Ok(())
        }
        Err(err) => Err(ActivityError::from(err)),
    }
}

/// Begin `op` on the registry, then on the repo.
pub(crate) async fn begin_repo_op(
    ctx: &ActivityContext,
    aggregates: &Aggregates,
    target: RepoTarget,
    op: RepoOp,
) -> Result<Begin, ActivityError> {
    let workflow = ctx.entity();

    let registry = ctx
        .run(aggregates.registry.begin_repo_op(target.registry, target.repo, workflow, op))
        .await?;
    if let Err(err) = registry {
        return refused_or_retry("registry", op, err);
    }

    let repos = ctx
        .run(aggregates.repos.begin_op(target.repo, workflow, op))
        .await?;
    if let Err(err) = repos {
        return refused_or_retry("repos", op, err);
    }
    Ok(Begin::Begun)
}

/// Commit `op` on the repo, then on the registry.
pub(crate) async fn commit_repo_op(
    ctx: &ActivityContext,
    aggregates: &Aggregates,
    target: RepoTarget,
    op: RepoOp,
) -> Result<(), ActivityError> {
    let workflow = ctx.entity();

    let repos = ctx
        .run(aggregates.repos.commit_op(target.repo, workflow, op))
        .await?;
    tolerate_nothing_pending("repos", "commit", repos)?;

    let registry = ctx
        .run(aggregates.registry.commit_repo_op(target.registry, target.repo, workflow, op))
        .await?;
    tolerate_nothing_pending("registry", "commit", registry)
}

/// Abort `op` on the repo, then on the registry.
///
/// Safe on aggregates that never saw the begin.
pub(crate) async fn abort_repo_op(
    ctx: &ActivityContext,
    aggregates: &Aggregates,
    target: RepoTarget,
    op: RepoOp,
    status: &Status,
) -> Result<(), ActivityError> {
    let workflow = ctx.entity();

    let repos = ctx
        .run(aggregates.repos.abort_op(target.repo, workflow, op, status))
        .await?;
    tolerate_nothing_pending("repos", "abort", repos)?;

    let registry = ctx
        .run(
            aggregates
                .registry
                .abort_repo_op(target.registry, target.repo, workflow, op, status),
        )
        .await?;
    tolerate_nothing_pending("registry", "abort", registry)
}

/// Send a command to the running workflow with version `vid`.
///
/// A version conflict means a concurrent writer appended an event the view
/// has not seen yet; the step is retried silently once it has.
pub(crate) async fn workflow_command<C: WorkflowCommand>(
    ctx: &ActivityContext,
    client: &dyn WorkflowClient<C>,
    vid: Vid,
    command: C,
) -> Result<Vid, ActivityError> {
    let name = command.name();
    debug!(workflow = %ctx.entity(), vid = %vid, command = name, "Workflow command");
    match ctx.run(client.command(ctx.entity(), vid, command)).await? {
        Ok(new_vid) => Ok(new_vid),
        Err(err) if is_version_conflict(&err) => {
            debug!(workflow = %ctx.entity(), command = name, error = %err, "Version conflict");
            Err(ActivityError::SilentRetry)
        }
        Err(err) => Err(ActivityError::from(err)),
    }
}

/// Send `command` and fold `event`, the event it appends, into `view`.
///
/// The view moves to the next state without waiting for the event to come
/// back on the stream; the redelivered event is skipped by replay.
pub(crate) async fn submit<V, C>(
    ctx: &ActivityContext,
    client: &dyn WorkflowClient<C>,
    view: &mut V,
    command: C,
    event: V::Event,
) -> Result<Step, ActivityError>
where
    V: View + Send,
    V::Event: Send,
    C: WorkflowCommand,
{
    let vid = workflow_command(ctx, client, view.vid(), command).await?;
    view.load_event(vid.as_event_id(), &event)?;
    Ok(Step::Continue)
}

/// Consecutive failures of a long external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExternalAttempts {
    failures: u32,
    max: u32,
}

impl ExternalAttempts {
    pub(crate) fn new(max: u32) -> Self {
        Self { failures: 0, max }
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

/// Run an external tool inside the activity.
///
/// Failures are retried by the engine until `attempts` is exhausted; then
/// the failure is returned as a status for the saga's failure path.
pub(crate) async fn external<T, F>(
    ctx: &ActivityContext,
    attempts: &mut ExternalAttempts,
    operation: F,
) -> Result<Result<T, Status>, ActivityError>
where
    F: Future<Output = Result<T, ToolError>> + Send,
{
    match ctx.run(operation).await? {
        Ok(value) => {
            attempts.failures = 0;
            Ok(Ok(value))
        }
        Err(err) => {
            attempts.failures = attempts.failures.saturating_add(1);
            if attempts.failures >= attempts.max {
                warn!(
                    workflow = %ctx.entity(),
                    attempts = attempts.failures,
                    error = %err,
                    "External operation failed; giving up"
                );
                attempts.failures = 0;
                Ok(Err(Status::new(Status::TOOL_FAILED, err.to_string())))
            } else {
                Err(ActivityError::failed(err))
            }
        }
    }
}

/// Working directory of a workflow.
pub(crate) fn working_dir(settings: &WorkflowSettings, workflow: EntityId) -> PathBuf {
    settings.working_dir_root.join(workflow.to_string())
}

/// Fail with a silent retry until `delay` has passed since `since`.
pub(crate) fn wait_until_due(
    ctx: &ActivityContext,
    since: DateTime<Utc>,
    delay: Duration,
) -> Result<(), ActivityError> {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500));
    let due = since + delay;
    if ctx.now() < due {
        Err(ActivityError::SilentRetryAfter(due))
    } else {
        Ok(())
    }
}

/// Remove a working directory, retrying on failure.
pub(crate) async fn remove_working_dir<F>(
    ctx: &ActivityContext,
    path: &Path,
    operation: F,
) -> Result<(), ActivityError>
where
    F: Future<Output = Result<(), ToolError>> + Send,
{
    debug!(workflow = %ctx.entity(), path = %path.display(), "Removing working directory");
    ctx.run(operation).await?.map_err(ActivityError::failed)
}

/// Error for a view that is missing data its state implies.
pub(crate) fn corrupt(kind: &str, what: &str) -> ActivityError {
    ActivityError::failed(format!("{kind} view has no {what}"))
}
