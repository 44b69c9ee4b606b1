//! unarchive-repo: restore a repository's files from its tar archive.
//!
//! Same shape as archive-repo without the tartt and swap phases: the
//! `Files` step runs the restore tool and commits its outcome.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fso_core::WorkflowSettings;
use fso_events::{EventId, Result as EventResult, View, Vid, advance};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityContext;
use crate::clients::{ArchiveTool, RepoOp, Status, WorkflowClient, WorkflowCommand};
use crate::error::ActivityError;
use crate::workflow::{Saga, Step};
use crate::workflows::common::{
    Aggregates, Begin, ExternalAttempts, RepoTarget, abort_repo_op, begin_repo_op,
    commit_repo_op, corrupt, external, remove_working_dir, submit, wait_until_due, working_dir,
};

const KIND: &str = "unarchive-repo";

/// Phase of an unarchive-repo workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnarchiveState {
    #[default]
    Uninitialized,
    Initialized,
    Files,
    FilesCompleted,
    FilesFailed,
    FilesEnded,
    GcCompleted,
    Completed,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnarchiveEvent {
    Started {
        target: RepoTarget,
        repo_path: PathBuf,
        tar_path: PathBuf,
    },
    FilesStarted {
        working_dir: PathBuf,
    },
    FilesCompleted,
    FilesFailed {
        status: Status,
    },
    FilesEnded,
    GcCompleted,
    Completed,
    Failed {
        status: Status,
    },
    Terminated {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnarchiveCommand {
    BeginFiles { working_dir: PathBuf },
    CommitFiles { status: Status },
    EndFiles,
    CommitGc,
    Commit,
    Abort { status: Status },
}

impl WorkflowCommand for UnarchiveCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::BeginFiles { .. } => "BeginFiles",
            Self::CommitFiles { .. } => "CommitFiles",
            Self::EndFiles => "EndFiles",
            Self::CommitGc => "CommitGc",
            Self::Commit => "Commit",
            Self::Abort { .. } => "Abort",
        }
    }
}

impl UnarchiveCommand {
    /// The event the workflow aggregate appends for this command.
    pub fn into_event(self) -> UnarchiveEvent {
        match self {
            Self::BeginFiles { working_dir } => UnarchiveEvent::FilesStarted { working_dir },
            Self::CommitFiles { status } if status.is_ok() => UnarchiveEvent::FilesCompleted,
            Self::CommitFiles { status } => UnarchiveEvent::FilesFailed { status },
            Self::EndFiles => UnarchiveEvent::FilesEnded,
            Self::CommitGc => UnarchiveEvent::GcCompleted,
            Self::Commit => UnarchiveEvent::Completed,
            Self::Abort { status } => UnarchiveEvent::Failed { status },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnarchiveView {
    pub vid: Vid,
    pub state: UnarchiveState,
    pub target: Option<RepoTarget>,
    pub repo_path: PathBuf,
    pub tar_path: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub failure: Option<Status>,
    pub files_ended_at: Option<DateTime<Utc>>,
}

impl View for UnarchiveView {
    type Event = UnarchiveEvent;

    fn load_event(&mut self, id: EventId, event: &UnarchiveEvent) -> EventResult<()> {
        let started = matches!(event, UnarchiveEvent::Started { .. });
        if started != (self.state == UnarchiveState::Uninitialized) {
            return Err(fso_events::Error::invalid_event(format!(
                "{KIND}: {event:?} in state {:?}",
                self.state
            )));
        }

        let next = match event {
            UnarchiveEvent::Started {
                target,
                repo_path,
                tar_path,
            } => {
                self.target = Some(*target);
                self.repo_path = repo_path.clone();
                self.tar_path = tar_path.clone();
                UnarchiveState::Initialized
            }
            UnarchiveEvent::FilesStarted { working_dir } => {
                self.working_dir = Some(working_dir.clone());
                UnarchiveState::Files
            }
            UnarchiveEvent::FilesCompleted => UnarchiveState::FilesCompleted,
            UnarchiveEvent::FilesFailed { status } => {
                self.failure = Some(status.clone());
                UnarchiveState::FilesFailed
            }
            UnarchiveEvent::FilesEnded => {
                self.files_ended_at = Some(id.timestamp());
                UnarchiveState::FilesEnded
            }
            UnarchiveEvent::GcCompleted => UnarchiveState::GcCompleted,
            UnarchiveEvent::Completed => UnarchiveState::Completed,
            UnarchiveEvent::Failed { status } => {
                if self.failure.is_none() {
                    self.failure = Some(status.clone());
                }
                UnarchiveState::Failed
            }
            UnarchiveEvent::Terminated { .. } => UnarchiveState::Terminated,
        };
        advance(&mut self.state, next);
        advance(&mut self.vid, Vid::from(id));
        Ok(())
    }

    fn vid(&self) -> Vid {
        self.vid
    }
}

/// Saga of one unarchive-repo workflow.
pub struct UnarchiveRepoSaga {
    view: UnarchiveView,
    commands: Arc<dyn WorkflowClient<UnarchiveCommand>>,
    aggregates: Aggregates,
    tool: Arc<dyn ArchiveTool>,
    settings: Arc<WorkflowSettings>,
    attempts: ExternalAttempts,
}

impl UnarchiveRepoSaga {
    pub fn new(
        commands: Arc<dyn WorkflowClient<UnarchiveCommand>>,
        aggregates: Aggregates,
        tool: Arc<dyn ArchiveTool>,
        settings: Arc<WorkflowSettings>,
    ) -> Self {
        let attempts = ExternalAttempts::new(settings.max_external_attempts);
        Self {
            view: UnarchiveView::default(),
            commands,
            aggregates,
            tool,
            settings,
            attempts,
        }
    }

    fn target(&self) -> Result<RepoTarget, ActivityError> {
        self.view.target.ok_or_else(|| corrupt(KIND, "target"))
    }

    fn working_dir(&self) -> Result<PathBuf, ActivityError> {
        self.view
            .working_dir
            .clone()
            .ok_or_else(|| corrupt(KIND, "working directory"))
    }

    async fn send(
        &mut self,
        ctx: &ActivityContext,
        command: UnarchiveCommand,
    ) -> Result<Step, ActivityError> {
        let event = command.clone().into_event();
        submit(ctx, self.commands.as_ref(), &mut self.view, command, event).await
    }

    async fn begin(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let target = self.target()?;
        if let Begin::Refused(status) =
            begin_repo_op(ctx, &self.aggregates, target, RepoOp::Unarchive).await?
        {
            abort_repo_op(ctx, &self.aggregates, target, RepoOp::Unarchive, &status).await?;
            self.send(ctx, UnarchiveCommand::Abort { status }).await?;
            return Ok(Step::Done);
        }
        let working_dir = working_dir(&self.settings, ctx.entity());
        self.send(ctx, UnarchiveCommand::BeginFiles { working_dir }).await
    }

    async fn restore(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let working_dir = self.working_dir()?;
        let repo_path = self.view.repo_path.clone();
        let tar_path = self.view.tar_path.clone();
        let tool = Arc::clone(&self.tool);

        let outcome = external(
            ctx,
            &mut self.attempts,
            tool.restore(&repo_path, &tar_path, &working_dir),
        )
        .await?;
        let status = outcome.err().unwrap_or_else(Status::ok);
        self.send(ctx, UnarchiveCommand::CommitFiles { status }).await
    }

    async fn end_files(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let target = self.target()?;
        match self.view.failure.clone() {
            None => commit_repo_op(ctx, &self.aggregates, target, RepoOp::Unarchive).await?,
            Some(status) => {
                abort_repo_op(ctx, &self.aggregates, target, RepoOp::Unarchive, &status).await?;
            }
        }
        self.send(ctx, UnarchiveCommand::EndFiles).await
    }

    async fn collect_garbage(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let ended_at = self
            .view
            .files_ended_at
            .ok_or_else(|| corrupt(KIND, "files end time"))?;
        wait_until_due(ctx, ended_at, self.settings.gc_delay())?;

        let working_dir = self.working_dir()?;
        remove_working_dir(ctx, &working_dir, self.tool.remove_working_dir(&working_dir)).await?;
        self.send(ctx, UnarchiveCommand::CommitGc).await
    }

    async fn finish(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let command = match self.view.failure.clone() {
            None => UnarchiveCommand::Commit,
            Some(status) => UnarchiveCommand::Abort { status },
        };
        self.send(ctx, command).await?;
        Ok(Step::Done)
    }
}

#[async_trait]
impl Saga for UnarchiveRepoSaga {
    type Event = UnarchiveEvent;
    type View = UnarchiveView;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn view(&self) -> &UnarchiveView {
        &self.view
    }

    fn view_mut(&mut self) -> &mut UnarchiveView {
        &mut self.view
    }

    async fn process_view(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        match self.view.state {
            UnarchiveState::Uninitialized => Ok(Step::Wait),
            UnarchiveState::Initialized => self.begin(ctx).await,
            UnarchiveState::Files => self.restore(ctx).await,
            UnarchiveState::FilesCompleted | UnarchiveState::FilesFailed => {
                self.end_files(ctx).await
            }
            UnarchiveState::FilesEnded => self.collect_garbage(ctx).await,
            UnarchiveState::GcCompleted => self.finish(ctx).await,
            UnarchiveState::Completed | UnarchiveState::Failed | UnarchiveState::Terminated => {
                Ok(Step::Done)
            }
        }
    }
}
