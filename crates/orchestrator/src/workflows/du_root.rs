//! du-root: scan the directory usage below a root and store it as events.
//!
//! `Initialized → DuRunning → DuCompleted | DuFailed → Completed | Failed`.
//! Results are appended in chunks of `du_batch_size` entries. The saga keeps
//! the scan results and how many entries it appended itself, so a failed
//! append or `CompleteDu` resumes where it stopped without scanning again.
//! A workflow whose history already holds entries this saga did not append
//! was interrupted mid-append by a restart and is failed instead.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fso_core::WorkflowSettings;
use fso_events::{EventId, Result as EventResult, View, Vid, advance};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activity::ActivityContext;
use crate::clients::{DuEntry, DuTool, Status, WorkflowClient, WorkflowCommand};
use crate::error::ActivityError;
use crate::workflow::{Saga, Step};
use crate::workflows::common::{ExternalAttempts, external, submit};

const KIND: &str = "du-root";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DuState {
    #[default]
    Uninitialized,
    Initialized,
    DuRunning,
    DuCompleted,
    DuFailed,
    Completed,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuEvent {
    Started { root: PathBuf, max_depth: usize },
    DuStarted,
    EntriesAppended { entries: Vec<DuEntry> },
    DuCompleted { total_usage: u64 },
    DuFailed { status: Status },
    Completed,
    Failed { status: Status },
    Terminated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuCommand {
    BeginDu,
    AppendEntries { entries: Vec<DuEntry> },
    CompleteDu { total_usage: u64 },
    FailDu { status: Status },
    Commit,
    Abort { status: Status },
}

impl WorkflowCommand for DuCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::BeginDu => "BeginDu",
            Self::AppendEntries { .. } => "AppendEntries",
            Self::CompleteDu { .. } => "CompleteDu",
            Self::FailDu { .. } => "FailDu",
            Self::Commit => "Commit",
            Self::Abort { .. } => "Abort",
        }
    }
}

impl DuCommand {
    pub fn into_event(self) -> DuEvent {
        match self {
            Self::BeginDu => DuEvent::DuStarted,
            Self::AppendEntries { entries } => DuEvent::EntriesAppended { entries },
            Self::CompleteDu { total_usage } => DuEvent::DuCompleted { total_usage },
            Self::FailDu { status } => DuEvent::DuFailed { status },
            Self::Commit => DuEvent::Completed,
            Self::Abort { status } => DuEvent::Failed { status },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuView {
    pub vid: Vid,
    pub state: DuState,
    pub root: PathBuf,
    pub max_depth: usize,
    pub entries: Vec<DuEntry>,
    pub total_usage: u64,
    pub failure: Option<Status>,
}

impl View for DuView {
    type Event = DuEvent;

    fn load_event(&mut self, id: EventId, event: &DuEvent) -> EventResult<()> {
        let started = matches!(event, DuEvent::Started { .. });
        if started != (self.state == DuState::Uninitialized) {
            return Err(fso_events::Error::invalid_event(format!(
                "{KIND}: {event:?} in state {:?}",
                self.state
            )));
        }

        let next = match event {
            DuEvent::Started { root, max_depth } => {
                self.root = root.clone();
                self.max_depth = *max_depth;
                DuState::Initialized
            }
            DuEvent::DuStarted => DuState::DuRunning,
            DuEvent::EntriesAppended { entries } => {
                self.entries.extend(entries.iter().cloned());
                DuState::DuRunning
            }
            DuEvent::DuCompleted { total_usage } => {
                self.total_usage = *total_usage;
                DuState::DuCompleted
            }
            DuEvent::DuFailed { status } => {
                self.failure = Some(status.clone());
                DuState::DuFailed
            }
            DuEvent::Completed => DuState::Completed,
            DuEvent::Failed { status } => {
                if self.failure.is_none() {
                    self.failure = Some(status.clone());
                }
                DuState::Failed
            }
            DuEvent::Terminated { .. } => DuState::Terminated,
        };
        advance(&mut self.state, next);
        advance(&mut self.vid, Vid::from(id));
        Ok(())
    }

    fn vid(&self) -> Vid {
        self.vid
    }
}

/// Sum of the top-level entries; deeper entries are already counted in them.
pub fn total_usage(entries: &[DuEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.path.components().count() == 1)
        .map(|e| e.usage)
        .sum()
}

pub struct DuRootSaga {
    view: DuView,
    commands: Arc<dyn WorkflowClient<DuCommand>>,
    tool: Arc<dyn DuTool>,
    batch_size: usize,
    attempts: ExternalAttempts,
    /// Scan results of this process, kept until `CompleteDu` lands.
    results: Option<Vec<DuEntry>>,
    /// Entries of `results` this saga appended.
    appended: usize,
}

impl DuRootSaga {
    pub fn new(
        commands: Arc<dyn WorkflowClient<DuCommand>>,
        tool: Arc<dyn DuTool>,
        settings: &WorkflowSettings,
    ) -> Self {
        Self {
            view: DuView::default(),
            commands,
            tool,
            batch_size: settings.du_batch_size.max(1),
            attempts: ExternalAttempts::new(settings.max_external_attempts),
            results: None,
            appended: 0,
        }
    }

    async fn send(&mut self, ctx: &ActivityContext, command: DuCommand) -> Result<Step, ActivityError> {
        let event = command.clone().into_event();
        submit(ctx, self.commands.as_ref(), &mut self.view, command, event).await
    }

    async fn run_du(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        if self.view.entries.len() > self.appended {
            warn!(
                workflow = %ctx.entity(),
                appended = self.view.entries.len(),
                "du results partially appended; failing workflow"
            );
            let status = Status::new(Status::INTERRUPTED, "du interrupted");
            return self.send(ctx, DuCommand::FailDu { status }).await;
        }

        let root = self.view.root.clone();
        let entries = match self.results.take() {
            Some(entries) => entries,
            None => {
                let max_depth = self.view.max_depth;
                let tool = Arc::clone(&self.tool);
                match external(ctx, &mut self.attempts, tool.du(&root, max_depth)).await? {
                    Ok(entries) => entries,
                    Err(status) => return self.send(ctx, DuCommand::FailDu { status }).await,
                }
            }
        };
        let entries = self.results.insert(entries).clone();

        let total = total_usage(&entries);
        for chunk in entries[self.appended..].chunks(self.batch_size) {
            self.send(
                ctx,
                DuCommand::AppendEntries {
                    entries: chunk.to_vec(),
                },
            )
            .await?;
            self.appended += chunk.len();
        }
        info!(
            workflow = %ctx.entity(),
            root = %root.display(),
            entries = entries.len(),
            total_usage = total,
            "du completed"
        );
        let step = self.send(ctx, DuCommand::CompleteDu { total_usage: total }).await?;
        self.results = None;
        Ok(step)
    }
}

#[async_trait]
impl Saga for DuRootSaga {
    type Event = DuEvent;
    type View = DuView;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn view(&self) -> &DuView {
        &self.view
    }

    fn view_mut(&mut self) -> &mut DuView {
        &mut self.view
    }

    async fn process_view(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        match self.view.state {
            DuState::Uninitialized => Ok(Step::Wait),
            DuState::Initialized => self.send(ctx, DuCommand::BeginDu).await,
            DuState::DuRunning => self.run_du(ctx).await,
            DuState::DuCompleted => {
                self.send(ctx, DuCommand::Commit).await?;
                Ok(Step::Done)
            }
            DuState::DuFailed => {
                let status = self
                    .view
                    .failure
                    .clone()
                    .unwrap_or_else(|| Status::new(Status::ABORTED, "du failed"));
                self.send(ctx, DuCommand::Abort { status }).await?;
                Ok(Step::Done)
            }
            DuState::Completed | DuState::Failed | DuState::Terminated => Ok(Step::Done),
        }
    }
}
