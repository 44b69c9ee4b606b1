//! freeze-repo and unfreeze-repo: toggle write access to a repository.
//!
//! `Initialized → Files → FilesCompleted | FilesFailed → Completed | Failed`.
//! Both kinds share events and commands; the [`RepoOp`] picks the tool call
//! and the op held on the aggregates.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fso_core::WorkflowSettings;
use fso_events::{EventId, Result as EventResult, View, Vid, advance};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityContext;
use crate::clients::{FreezeTool, RepoOp, Status, WorkflowClient, WorkflowCommand};
use crate::error::ActivityError;
use crate::workflow::{Saga, Step};
use crate::workflows::common::{
    Aggregates, Begin, ExternalAttempts, RepoTarget, abort_repo_op, begin_repo_op,
    commit_repo_op, corrupt, external, submit,
};

/// Phase of a freeze-repo or unfreeze-repo workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FreezeState {
    #[default]
    Uninitialized,
    Initialized,
    Files,
    FilesCompleted,
    FilesFailed,
    Completed,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezeEvent {
    Started {
        target: RepoTarget,
        repo_path: PathBuf,
    },
    FilesStarted,
    FilesCompleted,
    FilesFailed { status: Status },
    Completed,
    Failed { status: Status },
    Terminated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeCommand {
    BeginFiles,
    CommitFiles { status: Status },
    Commit,
    Abort { status: Status },
}

impl WorkflowCommand for FreezeCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::BeginFiles => "BeginFiles",
            Self::CommitFiles { .. } => "CommitFiles",
            Self::Commit => "Commit",
            Self::Abort { .. } => "Abort",
        }
    }
}

impl FreezeCommand {
    /// The event the workflow aggregate appends for this command.
    pub fn into_event(self) -> FreezeEvent {
        match self {
            Self::BeginFiles => FreezeEvent::FilesStarted,
            Self::CommitFiles { status } if status.is_ok() => FreezeEvent::FilesCompleted,
            Self::CommitFiles { status } => FreezeEvent::FilesFailed { status },
            Self::Commit => FreezeEvent::Completed,
            Self::Abort { status } => FreezeEvent::Failed { status },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreezeView {
    pub vid: Vid,
    pub state: FreezeState,
    pub target: Option<RepoTarget>,
    pub repo_path: PathBuf,
    pub failure: Option<Status>,
}

impl View for FreezeView {
    type Event = FreezeEvent;

    fn load_event(&mut self, id: EventId, event: &FreezeEvent) -> EventResult<()> {
        let started = matches!(event, FreezeEvent::Started { .. });
        if started != (self.state == FreezeState::Uninitialized) {
            return Err(fso_events::Error::invalid_event(format!(
                "freeze: {event:?} in state {:?}",
                self.state
            )));
        }

        let next = match event {
            FreezeEvent::Started { target, repo_path } => {
                self.target = Some(*target);
                self.repo_path = repo_path.clone();
                FreezeState::Initialized
            }
            FreezeEvent::FilesStarted => FreezeState::Files,
            FreezeEvent::FilesCompleted => FreezeState::FilesCompleted,
            FreezeEvent::FilesFailed { status } => {
                self.failure = Some(status.clone());
                FreezeState::FilesFailed
            }
            FreezeEvent::Completed => FreezeState::Completed,
            FreezeEvent::Failed { status } => {
                if self.failure.is_none() {
                    self.failure = Some(status.clone());
                }
                FreezeState::Failed
            }
            FreezeEvent::Terminated { .. } => FreezeState::Terminated,
        };
        advance(&mut self.state, next);
        advance(&mut self.vid, Vid::from(id));
        Ok(())
    }

    fn vid(&self) -> Vid {
        self.vid
    }
}

/// Saga of one freeze-repo or unfreeze-repo workflow.
pub struct FreezeRepoSaga {
    op: RepoOp,
    view: FreezeView,
    commands: Arc<dyn WorkflowClient<FreezeCommand>>,
    aggregates: Aggregates,
    tool: Arc<dyn FreezeTool>,
    attempts: ExternalAttempts,
}

impl FreezeRepoSaga {
    /// A freeze-repo saga.
    pub fn freeze(
        commands: Arc<dyn WorkflowClient<FreezeCommand>>,
        aggregates: Aggregates,
        tool: Arc<dyn FreezeTool>,
        settings: &WorkflowSettings,
    ) -> Self {
        Self::new(RepoOp::Freeze, commands, aggregates, tool, settings)
    }

    /// An unfreeze-repo saga.
    pub fn unfreeze(
        commands: Arc<dyn WorkflowClient<FreezeCommand>>,
        aggregates: Aggregates,
        tool: Arc<dyn FreezeTool>,
        settings: &WorkflowSettings,
    ) -> Self {
        Self::new(RepoOp::Unfreeze, commands, aggregates, tool, settings)
    }

    fn new(
        op: RepoOp,
        commands: Arc<dyn WorkflowClient<FreezeCommand>>,
        aggregates: Aggregates,
        tool: Arc<dyn FreezeTool>,
        settings: &WorkflowSettings,
    ) -> Self {
        Self {
            op,
            view: FreezeView::default(),
            commands,
            aggregates,
            tool,
            attempts: ExternalAttempts::new(settings.max_external_attempts),
        }
    }

    fn target(&self) -> Result<RepoTarget, ActivityError> {
        self.view
            .target
            .ok_or_else(|| corrupt(self.kind(), "target"))
    }

    async fn send(
        &mut self,
        ctx: &ActivityContext,
        command: FreezeCommand,
    ) -> Result<Step, ActivityError> {
        let event = command.clone().into_event();
        submit(ctx, self.commands.as_ref(), &mut self.view, command, event).await
    }

    async fn begin(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let target = self.target()?;
        if let Begin::Refused(status) = begin_repo_op(ctx, &self.aggregates, target, self.op).await? {
            abort_repo_op(ctx, &self.aggregates, target, self.op, &status).await?;
            self.send(ctx, FreezeCommand::Abort { status }).await?;
            return Ok(Step::Done);
        }
        self.send(ctx, FreezeCommand::BeginFiles).await
    }

    async fn toggle(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let repo_path = self.view.repo_path.clone();
        let tool = Arc::clone(&self.tool);
        let op = self.op;
        let operation = async {
            match op {
                RepoOp::Unfreeze => tool.unfreeze(&repo_path).await,
                _ => tool.freeze(&repo_path).await,
            }
        };
        let outcome = external(ctx, &mut self.attempts, operation).await?;
        let status = outcome.err().unwrap_or_else(Status::ok);
        self.send(ctx, FreezeCommand::CommitFiles { status }).await
    }

    async fn finish(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let target = self.target()?;
        let command = match self.view.failure.clone() {
            None => {
                commit_repo_op(ctx, &self.aggregates, target, self.op).await?;
                FreezeCommand::Commit
            }
            Some(status) => {
                abort_repo_op(ctx, &self.aggregates, target, self.op, &status).await?;
                FreezeCommand::Abort { status }
            }
        };
        self.send(ctx, command).await?;
        Ok(Step::Done)
    }
}

#[async_trait]
impl Saga for FreezeRepoSaga {
    type Event = FreezeEvent;
    type View = FreezeView;

    fn kind(&self) -> &'static str {
        match self.op {
            RepoOp::Unfreeze => "unfreeze-repo",
            _ => "freeze-repo",
        }
    }

    fn view(&self) -> &FreezeView {
        &self.view
    }

    fn view_mut(&mut self) -> &mut FreezeView {
        &mut self.view
    }

    async fn process_view(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        match self.view.state {
            FreezeState::Uninitialized => Ok(Step::Wait),
            FreezeState::Initialized => self.begin(ctx).await,
            FreezeState::Files => self.toggle(ctx).await,
            FreezeState::FilesCompleted | FreezeState::FilesFailed => self.finish(ctx).await,
            FreezeState::Completed | FreezeState::Failed | FreezeState::Terminated => {
                Ok(Step::Done)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fso_events::EntityId;
    use ulid::Ulid;

    fn id(ms: u64) -> EventId {
        EventId::from_ulid(Ulid::from_parts(ms, 1))
    }

    #[test]
    fn test_failed_files_keep_status() {
        let mut view = FreezeView::default();
        view.load_event(
            id(1),
            &FreezeEvent::Started {
                target: RepoTarget {
                    registry: EntityId::new(),
                    repo: EntityId::new(),
                },
                repo_path: PathBuf::from("/data/repo"),
            },
        )
        .unwrap();
        view.load_event(id(2), &FreezeEvent::FilesStarted).unwrap();
        let status = Status::new(Status::TOOL_FAILED, "chattr failed");
        view.load_event(
            id(3),
            &FreezeEvent::FilesFailed {
                status: status.clone(),
            },
        )
        .unwrap();

        assert_eq!(view.state, FreezeState::FilesFailed);
        assert_eq!(view.failure, Some(status));
    }
}
