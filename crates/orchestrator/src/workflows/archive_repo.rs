//! archive-repo: move a repository's files into a tar archive.
//!
//! ```text
//! Initialized ─► Files ─► TarttCompleted ─► SwapStarted ─┬─► FilesCompleted ─┐
//!                  │                                      └─► FilesFailed ◄───┤
//!                  └──────────────(tool gave up)──────────────────┘          ▼
//!                                                       FilesEnded ─► GcCompleted ─► Completed | Failed
//! ```
//!
//! A refused begin skips straight to `Failed` after aborting on both
//! aggregates. The working directory is kept for `gc_delay` after the files
//! ended, so a failed swap can still be inspected.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fso_core::WorkflowSettings;
use fso_events::{EventId, Result as EventResult, View, Vid, advance};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityContext;
use crate::clients::{AclPolicy, ArchiveTool, RepoOp, Status, WorkflowClient, WorkflowCommand};
use crate::error::ActivityError;
use crate::workflow::{Saga, Step};
use crate::workflows::common::{
    Aggregates, Begin, ExternalAttempts, RepoTarget, abort_repo_op, begin_repo_op,
    commit_repo_op, corrupt, external, remove_working_dir, submit, wait_until_due, working_dir,
};

const KIND: &str = "archive-repo";

/// Phase of an archive-repo workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArchiveState {
    #[default]
    Uninitialized,
    Initialized,
    Files,
    TarttCompleted,
    SwapStarted,
    FilesCompleted,
    FilesFailed,
    FilesEnded,
    GcCompleted,
    Completed,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveEvent {
    Started {
        target: RepoTarget,
        repo_path: PathBuf,
    },
    FilesStarted {
        acl: AclPolicy,
        working_dir: PathBuf,
    },
    TarttCompleted {
        tar_path: PathBuf,
    },
    SwapStarted,
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
pub enum ArchiveCommand {
    BeginFiles {
        acl: AclPolicy,
        working_dir: PathBuf,
    },
    CommitTartt {
        tar_path: PathBuf,
    },
    BeginSwap,
    CommitFiles {
        status: Status,
    },
    EndFiles,
    CommitGc,
    Commit,
    Abort {
        status: Status,
    },
}

impl WorkflowCommand for ArchiveCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::BeginFiles { .. } => "BeginFiles",
            Self::CommitTartt { .. } => "CommitTartt",
            Self::BeginSwap => "BeginSwap",
            Self::CommitFiles { .. } => "CommitFiles",
            Self::EndFiles => "EndFiles",
            Self::CommitGc => "CommitGc",
            Self::Commit => "Commit",
            Self::Abort { .. } => "Abort",
        }
    }
}

impl ArchiveCommand {
    /// The event the workflow aggregate appends for this command.
    pub fn into_event(self) -> ArchiveEvent {
        match self {
            Self::BeginFiles { acl, working_dir } => ArchiveEvent::FilesStarted { acl, working_dir },
            Self::CommitTartt { tar_path } => ArchiveEvent::TarttCompleted { tar_path },
            Self::BeginSwap => ArchiveEvent::SwapStarted,
            Self::CommitFiles { status } if status.is_ok() => ArchiveEvent::FilesCompleted,
            Self::CommitFiles { status } => ArchiveEvent::FilesFailed { status },
            Self::EndFiles => ArchiveEvent::FilesEnded,
            Self::CommitGc => ArchiveEvent::GcCompleted,
            Self::Commit => ArchiveEvent::Completed,
            Self::Abort { status } => ArchiveEvent::Failed { status },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveView {
    pub vid: Vid,
    pub state: ArchiveState,
    pub target: Option<RepoTarget>,
    pub repo_path: PathBuf,
    pub acl: Option<AclPolicy>,
    pub working_dir: Option<PathBuf>,
    pub tar_path: Option<PathBuf>,
    pub failure: Option<Status>,
    pub files_ended_at: Option<DateTime<Utc>>,
}

impl View for ArchiveView {
    type Event = ArchiveEvent;

    fn load_event(&mut self, id: EventId, event: &ArchiveEvent) -> EventResult<()> {
        let started = matches!(event, ArchiveEvent::Started { .. });
        if started != (self.state == ArchiveState::Uninitialized) {
            return Err(fso_events::Error::invalid_event(format!(
                "{KIND}: {event:?} in state {:?}",
                self.state
            )));
        }

        let next = match event {
            ArchiveEvent::Started { target, repo_path } => {
                self.target = Some(*target);
                self.repo_path = repo_path.clone();
                ArchiveState::Initialized
            }
            ArchiveEvent::FilesStarted { acl, working_dir } => {
                self.acl = Some(acl.clone());
                self.working_dir = Some(working_dir.clone());
                ArchiveState::Files
            }
            ArchiveEvent::TarttCompleted { tar_path } => {
                self.tar_path = Some(tar_path.clone());
                ArchiveState::TarttCompleted
            }
            ArchiveEvent::SwapStarted => ArchiveState::SwapStarted,
            ArchiveEvent::FilesCompleted => ArchiveState::FilesCompleted,
            ArchiveEvent::FilesFailed { status } => {
                self.failure = Some(status.clone());
                ArchiveState::FilesFailed
            }
            ArchiveEvent::FilesEnded => {
                self.files_ended_at = Some(id.timestamp());
                ArchiveState::FilesEnded
            }
            ArchiveEvent::GcCompleted => ArchiveState::GcCompleted,
            ArchiveEvent::Completed => ArchiveState::Completed,
            ArchiveEvent::Failed { status } => {
                if self.failure.is_none() {
                    self.failure = Some(status.clone());
                }
                ArchiveState::Failed
            }
            ArchiveEvent::Terminated { .. } => ArchiveState::Terminated,
        };
        advance(&mut self.state, next);
        advance(&mut self.vid, Vid::from(id));
        Ok(())
    }

    fn vid(&self) -> Vid {
        self.vid
    }
}

/// Saga of one archive-repo workflow.
pub struct ArchiveRepoSaga {
    view: ArchiveView,
    commands: Arc<dyn WorkflowClient<ArchiveCommand>>,
    aggregates: Aggregates,
    tool: Arc<dyn ArchiveTool>,
    settings: Arc<WorkflowSettings>,
    attempts: ExternalAttempts,
}

impl ArchiveRepoSaga {
    pub fn new(
        commands: Arc<dyn WorkflowClient<ArchiveCommand>>,
        aggregates: Aggregates,
        tool: Arc<dyn ArchiveTool>,
        settings: Arc<WorkflowSettings>,
    ) -> Self {
        let attempts = ExternalAttempts::new(settings.max_external_attempts);
        Self {
            view: ArchiveView::default(),
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

    async fn send(&mut self, ctx: &ActivityContext, command: ArchiveCommand) -> Result<Step, ActivityError> {
        let event = command.clone().into_event();
        submit(ctx, self.commands.as_ref(), &mut self.view, command, event).await
    }

    /// Begin on registry and repo, then start the files phase.
    async fn begin(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let target = self.target()?;
        if let Begin::Refused(status) =
            begin_repo_op(ctx, &self.aggregates, target, RepoOp::Archive).await?
        {
            abort_repo_op(ctx, &self.aggregates, target, RepoOp::Archive, &status).await?;
            self.send(ctx, ArchiveCommand::Abort { status }).await?;
            return Ok(Step::Done);
        }

        let acl = ctx
            .run(self.aggregates.registry.repo_acl_policy(target.registry, target.repo))
            .await??;
        let working_dir = working_dir(&self.settings, ctx.entity());
        self.send(ctx, ArchiveCommand::BeginFiles { acl, working_dir })
            .await
    }

    async fn tartt(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let working_dir = self.working_dir()?;
        let acl = self.view.acl.clone().unwrap_or_default();
        let repo_path = self.view.repo_path.clone();
        let tool = Arc::clone(&self.tool);

        let outcome = external(
            ctx,
            &mut self.attempts,
            tool.archive_tartt(&repo_path, &working_dir, &acl),
        )
        .await?;
        match outcome {
            Ok(tar_path) => self.send(ctx, ArchiveCommand::CommitTartt { tar_path }).await,
            Err(status) => self.send(ctx, ArchiveCommand::CommitFiles { status }).await,
        }
    }

    async fn swap(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let working_dir = self.working_dir()?;
        let repo_path = self.view.repo_path.clone();
        let tool = Arc::clone(&self.tool);

        let outcome = external(ctx, &mut self.attempts, tool.swap(&repo_path, &working_dir)).await?;
        let status = outcome.err().unwrap_or_else(Status::ok);
        self.send(ctx, ArchiveCommand::CommitFiles { status }).await
    }

    /// Commit or abort on the aggregates, then end the files phase.
    async fn end_files(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let target = self.target()?;
        match self.view.failure.clone() {
            None => commit_repo_op(ctx, &self.aggregates, target, RepoOp::Archive).await?,
            Some(status) => {
                abort_repo_op(ctx, &self.aggregates, target, RepoOp::Archive, &status).await?;
            }
        }
        self.send(ctx, ArchiveCommand::EndFiles).await
    }

    async fn collect_garbage(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let ended_at = self
            .view
            .files_ended_at
            .ok_or_else(|| corrupt(KIND, "files end time"))?;
        wait_until_due(ctx, ended_at, self.settings.gc_delay())?;

        let working_dir = self.working_dir()?;
        remove_working_dir(ctx, &working_dir, self.tool.remove_working_dir(&working_dir)).await?;
        self.send(ctx, ArchiveCommand::CommitGc).await
    }

    async fn finish(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let command = match self.view.failure.clone() {
            None => ArchiveCommand::Commit,
            Some(status) => ArchiveCommand::Abort { status },
        };
        self.send(ctx, command).await?;
        Ok(Step::Done)
    }
}

#[async_trait]
impl Saga for ArchiveRepoSaga {
    type Event = ArchiveEvent;
    type View = ArchiveView;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn view(&self) -> &ArchiveView {
        &self.view
    }

    fn view_mut(&mut self) -> &mut ArchiveView {
        &mut self.view
    }

    async fn process_view(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        match self.view.state {
            ArchiveState::Uninitialized => Ok(Step::Wait),
            ArchiveState::Initialized => self.begin(ctx).await,
            ArchiveState::Files => self.tartt(ctx).await,
            ArchiveState::TarttCompleted => self.send(ctx, ArchiveCommand::BeginSwap).await,
            ArchiveState::SwapStarted => self.swap(ctx).await,
            ArchiveState::FilesCompleted | ArchiveState::FilesFailed => self.end_files(ctx).await,
            ArchiveState::FilesEnded => self.collect_garbage(ctx).await,
            ArchiveState::GcCompleted => self.finish(ctx).await,
            ArchiveState::Completed | ArchiveState::Failed | ArchiveState::Terminated => {
                Ok(Step::Done)
            }
        }
    }
}
