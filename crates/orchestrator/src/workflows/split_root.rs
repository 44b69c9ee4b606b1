//! split-root: find subdirectories of a root that are large enough to be
//! split into repositories of their own.
//!
//! `Initialized → DuRunning → DuCompleted | DuFailed → AnalysisCompleted`.
//! The administrator then decides per candidate and commits or aborts; those
//! commands arrive here as events.
//!
//! Retries are asymmetric:
//!
//! - `Initialized` and the du scan retry like every other step.
//! - A version conflict on `CompleteDu` in `DuRunning` does not retry.
//! - Any failure to append the analysis in `DuCompleted` does not retry.
//!
//! In both cases the saga waits until the administrator re-triggers the
//! workflow, which appends an event and so re-runs the step.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fso_core::{SplitRootSettings, WorkflowSettings};
use fso_events::{EventId, Result as EventResult, View, Vid, advance};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::activity::ActivityContext;
use crate::clients::{DuEntry, DuTool, Status, WorkflowClient, WorkflowCommand};
use crate::error::ActivityError;
use crate::workflow::{Saga, Step};
use crate::workflows::common::{ExternalAttempts, external, submit};

const KIND: &str = "split-root";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SplitState {
    #[default]
    Uninitialized,
    Initialized,
    DuRunning,
    DuCompleted,
    DuFailed,
    AnalysisCompleted,
    Completed,
    Failed,
    Terminated,
}

/// A subdirectory proposed for splitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCandidate {
    pub path: PathBuf,
    pub usage: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitEvent {
    Started { root: PathBuf },
    DuStarted,
    DuCompleted { entries: Vec<DuEntry> },
    DuFailed { status: Status },
    AnalysisCompleted { candidates: Vec<SplitCandidate> },
    /// Appended by the administrator to re-run a waiting step.
    Retriggered,
    /// Administrator decision on one candidate.
    Decided { path: PathBuf, split: bool },
    Completed,
    Failed { status: Status },
    Terminated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitCommand {
    BeginDu,
    CompleteDu { entries: Vec<DuEntry> },
    FailDu { status: Status },
    CompleteAnalysis { candidates: Vec<SplitCandidate> },
    Abort { status: Status },
}

impl WorkflowCommand for SplitCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::BeginDu => "BeginDu",
            Self::CompleteDu { .. } => "CompleteDu",
            Self::FailDu { .. } => "FailDu",
            Self::CompleteAnalysis { .. } => "CompleteAnalysis",
            Self::Abort { .. } => "Abort",
        }
    }
}

impl SplitCommand {
    pub fn into_event(self) -> SplitEvent {
        match self {
            Self::BeginDu => SplitEvent::DuStarted,
            Self::CompleteDu { entries } => SplitEvent::DuCompleted { entries },
            Self::FailDu { status } => SplitEvent::DuFailed { status },
            Self::CompleteAnalysis { candidates } => SplitEvent::AnalysisCompleted { candidates },
            Self::Abort { status } => SplitEvent::Failed { status },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitView {
    pub vid: Vid,
    pub state: SplitState,
    pub root: PathBuf,
    pub entries: Vec<DuEntry>,
    pub candidates: Vec<SplitCandidate>,
    /// Administrator decisions per candidate path, latest wins. Only read for
    /// reporting; the final commit or abort arrives as its own event.
    pub decisions: Vec<(PathBuf, bool)>,
    pub failure: Option<Status>,
}

impl View for SplitView {
    type Event = SplitEvent;

    fn load_event(&mut self, id: EventId, event: &SplitEvent) -> EventResult<()> {
        let started = matches!(event, SplitEvent::Started { .. });
        if started != (self.state == SplitState::Uninitialized) {
            return Err(fso_events::Error::invalid_event(format!(
                "{KIND}: {event:?} in state {:?}",
                self.state
            )));
        }

        let next = match event {
            SplitEvent::Started { root } => {
                self.root = root.clone();
                SplitState::Initialized
            }
            SplitEvent::DuStarted => SplitState::DuRunning,
            SplitEvent::DuCompleted { entries } => {
                self.entries = entries.clone();
                SplitState::DuCompleted
            }
            SplitEvent::DuFailed { status } => {
                self.failure = Some(status.clone());
                SplitState::DuFailed
            }
            SplitEvent::AnalysisCompleted { candidates } => {
                self.candidates = candidates.clone();
                SplitState::AnalysisCompleted
            }
            SplitEvent::Retriggered => self.state,
            SplitEvent::Decided { path, split } => {
                self.decisions.retain(|(p, _)| p != path);
                self.decisions.push((path.clone(), *split));
                self.state
            }
            SplitEvent::Completed => SplitState::Completed,
            SplitEvent::Failed { status } => {
                if self.failure.is_none() {
                    self.failure = Some(status.clone());
                }
                SplitState::Failed
            }
            SplitEvent::Terminated { .. } => SplitState::Terminated,
        };
        advance(&mut self.state, next);
        advance(&mut self.vid, Vid::from(id));
        Ok(())
    }

    fn vid(&self) -> Vid {
        self.vid
    }
}

impl SplitView {
    /// Candidates the administrator has not decided on yet.
    pub fn undecided(&self) -> impl Iterator<Item = &SplitCandidate> {
        self.candidates
            .iter()
            .filter(|c| !self.decisions.iter().any(|(path, _)| *path == c.path))
    }
}

/// Entries within `max_depth` and at least `min_usage_bytes`, largest first.
pub fn split_candidates(entries: &[DuEntry], settings: &SplitRootSettings) -> Vec<SplitCandidate> {
    let mut candidates: Vec<SplitCandidate> = entries
        .iter()
        .filter(|e| {
            let depth = e.path.components().count();
            depth >= 1 && depth <= settings.max_depth && e.usage >= settings.min_usage_bytes
        })
        .map(|e| SplitCandidate {
            path: e.path.clone(),
            usage: e.usage,
        })
        .collect();
    candidates.sort_by(|a, b| b.usage.cmp(&a.usage).then_with(|| a.path.cmp(&b.path)));
    candidates
}

pub struct SplitRootSaga {
    view: SplitView,
    commands: Arc<dyn WorkflowClient<SplitCommand>>,
    tool: Arc<dyn DuTool>,
    settings: SplitRootSettings,
    attempts: ExternalAttempts,
}

impl SplitRootSaga {
    pub fn new(
        commands: Arc<dyn WorkflowClient<SplitCommand>>,
        tool: Arc<dyn DuTool>,
        settings: &WorkflowSettings,
    ) -> Self {
        Self {
            view: SplitView::default(),
            commands,
            tool,
            settings: settings.split_root,
            attempts: ExternalAttempts::new(settings.max_external_attempts),
        }
    }

    async fn send(&mut self, ctx: &ActivityContext, command: SplitCommand) -> Result<Step, ActivityError> {
        let event = command.clone().into_event();
        submit(ctx, self.commands.as_ref(), &mut self.view, command, event).await
    }

    async fn run_du(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let root = self.view.root.clone();
        let tool = Arc::clone(&self.tool);
        let max_depth = self.settings.max_depth;
        let command = match external(ctx, &mut self.attempts, tool.du(&root, max_depth)).await? {
            Ok(entries) => SplitCommand::CompleteDu { entries },
            Err(status) => SplitCommand::FailDu { status },
        };
        match self.send(ctx, command).await {
            Err(ActivityError::SilentRetry) => {
                warn!(workflow = %ctx.entity(), "du result conflicts with newer events; waiting for retrigger");
                Ok(Step::Wait)
            }
            other => other,
        }
    }

    async fn analyze(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let candidates = split_candidates(&self.view.entries, &self.settings);
        info!(
            workflow = %ctx.entity(),
            root = %self.view.root.display(),
            candidates = candidates.len(),
            "Split analysis completed"
        );
        match self.send(ctx, SplitCommand::CompleteAnalysis { candidates }).await {
            Err(ActivityError::Cancelled) => Err(ActivityError::Cancelled),
            Err(e) => {
                warn!(workflow = %ctx.entity(), error = %e, "Storing split analysis failed; waiting for retrigger");
                Ok(Step::Wait)
            }
            ok => ok,
        }
    }
}

#[async_trait]
impl Saga for SplitRootSaga {
    type Event = SplitEvent;
    type View = SplitView;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn view(&self) -> &SplitView {
        &self.view
    }

    fn view_mut(&mut self) -> &mut SplitView {
        &mut self.view
    }

    async fn process_view(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        match self.view.state {
            SplitState::Uninitialized => Ok(Step::Wait),
            SplitState::Initialized => self.send(ctx, SplitCommand::BeginDu).await,
            SplitState::DuRunning => self.run_du(ctx).await,
            SplitState::DuCompleted => self.analyze(ctx).await,
            SplitState::DuFailed => {
                let status = self
                    .view
                    .failure
                    .clone()
                    .unwrap_or_else(|| Status::new(Status::ABORTED, "du failed"));
                self.send(ctx, SplitCommand::Abort { status }).await?;
                Ok(Step::Done)
            }
            SplitState::AnalysisCompleted => {
                debug!(
                    workflow = %ctx.entity(),
                    decided = self.view.decisions.len(),
                    undecided = self.view.undecided().count(),
                    "Waiting for the administrator"
                );
                Ok(Step::Wait)
            }
            SplitState::Completed | SplitState::Failed | SplitState::Terminated => Ok(Step::Done),
        }
    }
}
