//! The workflow kinds and the factory that starts them on the engine.

pub mod archive_repo;
pub mod common;
pub mod du_root;
pub mod freeze_repo;
pub mod ping_registry;
pub mod split_root;
pub mod unarchive_repo;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use fso_core::WorkflowSettings;
use fso_events::{EntityId, EventSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::activity::{ActivityClass, EventSourced, Runnable};
use crate::clients::{ArchiveTool, DuTool, FreezeTool, HostPinger, WorkflowClient};
use crate::engine::{Completion, Engine, WeakEngine};
use crate::error::EngineError;
use crate::workflow::WorkflowActivity;

use archive_repo::{ArchiveCommand, ArchiveEvent, ArchiveRepoSaga};
use common::Aggregates;
use du_root::{DuCommand, DuEvent, DuRootSaga};
use freeze_repo::{FreezeCommand, FreezeEvent, FreezeRepoSaga};
use ping_registry::{PingCommand, PingEvent, PingRegistrySaga};
use split_root::{SplitCommand, SplitEvent, SplitRootSaga};
use unarchive_repo::{UnarchiveCommand, UnarchiveEvent, UnarchiveRepoSaga};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    ArchiveRepo,
    UnarchiveRepo,
    FreezeRepo,
    UnfreezeRepo,
    PingRegistry,
    SplitRoot,
    DuRoot,
}

impl WorkflowKind {
    pub const ALL: [Self; 7] = [
        Self::ArchiveRepo,
        Self::UnarchiveRepo,
        Self::FreezeRepo,
        Self::UnfreezeRepo,
        Self::PingRegistry,
        Self::SplitRoot,
        Self::DuRoot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArchiveRepo => "archive-repo",
            Self::UnarchiveRepo => "unarchive-repo",
            Self::FreezeRepo => "freeze-repo",
            Self::UnfreezeRepo => "unfreeze-repo",
            Self::PingRegistry => "ping-registry",
            Self::SplitRoot => "split-root",
            Self::DuRoot => "du-root",
        }
    }

    /// Whether the workflow operates on a single repository.
    pub fn is_repo_level(&self) -> bool {
        matches!(
            self,
            Self::ArchiveRepo | Self::UnarchiveRepo | Self::FreezeRepo | Self::UnfreezeRepo
        )
    }

    /// Limiter pool the workflow's activity draws from.
    pub fn class(&self) -> ActivityClass {
        match self {
            Self::ArchiveRepo | Self::UnarchiveRepo | Self::FreezeRepo | Self::UnfreezeRepo => {
                ActivityClass::Repo
            }
            Self::PingRegistry | Self::SplitRoot | Self::DuRoot => ActivityClass::Workflow,
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event source and command client of one workflow aggregate type.
pub struct WorkflowBackend<E, C> {
    pub events: Arc<dyn EventSource<E>>,
    pub commands: Arc<dyn WorkflowClient<C>>,
}

impl<E, C> Clone for WorkflowBackend<E, C> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            commands: Arc::clone(&self.commands),
        }
    }
}

/// Everything the workflow sagas talk to.
#[derive(Clone)]
pub struct Backends {
    pub aggregates: Aggregates,
    pub archive_tool: Arc<dyn ArchiveTool>,
    pub freeze_tool: Arc<dyn FreezeTool>,
    pub du_tool: Arc<dyn DuTool>,
    pub pinger: Arc<dyn HostPinger>,
    pub archive: WorkflowBackend<ArchiveEvent, ArchiveCommand>,
    pub unarchive: WorkflowBackend<UnarchiveEvent, UnarchiveCommand>,
    /// Shared by freeze-repo and unfreeze-repo.
    pub freeze: WorkflowBackend<FreezeEvent, FreezeCommand>,
    pub du: WorkflowBackend<DuEvent, DuCommand>,
    pub split: WorkflowBackend<SplitEvent, SplitCommand>,
    pub ping: WorkflowBackend<PingEvent, PingCommand>,
}

/// Starts workflow activities discovered by an index.
pub trait WorkflowStarter: Send + Sync {
    /// Start the activity of `workflow`. `repo` is the repository of a
    /// repo-level workflow; such workflows run one at a time per repository.
    fn start(
        &self,
        kind: WorkflowKind,
        workflow: EntityId,
        repo: Option<EntityId>,
    ) -> Result<(), EngineError>;
}

/// Builds workflow activities and registers them on the engine.
pub struct WorkflowFactory {
    engine: WeakEngine,
    backends: Arc<Backends>,
    settings: Arc<WorkflowSettings>,
    /// Completion of the last workflow started per repository.
    chains: Mutex<HashMap<EntityId, Completion>>,
}

impl WorkflowFactory {
    pub fn new(engine: &Engine, backends: Backends, settings: WorkflowSettings) -> Self {
        Self {
            engine: engine.downgrade(),
            backends: Arc::new(backends),
            settings: Arc::new(settings),
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh activity for a workflow of `kind`.
    pub fn runnable(&self, kind: WorkflowKind) -> Box<dyn Runnable> {
        let b = &self.backends;
        let settings = &self.settings;
        match kind {
            WorkflowKind::ArchiveRepo => Box::new(EventSourced::new(
                Arc::clone(&b.archive.events),
                WorkflowActivity::new(ArchiveRepoSaga::new(
                    Arc::clone(&b.archive.commands),
                    b.aggregates.clone(),
                    Arc::clone(&b.archive_tool),
                    Arc::clone(settings),
                )),
            )),
            WorkflowKind::UnarchiveRepo => Box::new(EventSourced::new(
                Arc::clone(&b.unarchive.events),
                WorkflowActivity::new(UnarchiveRepoSaga::new(
                    Arc::clone(&b.unarchive.commands),
                    b.aggregates.clone(),
                    Arc::clone(&b.archive_tool),
                    Arc::clone(settings),
                )),
            )),
            WorkflowKind::FreezeRepo => Box::new(EventSourced::new(
                Arc::clone(&b.freeze.events),
                WorkflowActivity::new(FreezeRepoSaga::freeze(
                    Arc::clone(&b.freeze.commands),
                    b.aggregates.clone(),
                    Arc::clone(&b.freeze_tool),
                    settings,
                )),
            )),
            WorkflowKind::UnfreezeRepo => Box::new(EventSourced::new(
                Arc::clone(&b.freeze.events),
                WorkflowActivity::new(FreezeRepoSaga::unfreeze(
                    Arc::clone(&b.freeze.commands),
                    b.aggregates.clone(),
                    Arc::clone(&b.freeze_tool),
                    settings,
                )),
            )),
            WorkflowKind::PingRegistry => Box::new(EventSourced::new(
                Arc::clone(&b.ping.events),
                WorkflowActivity::new(PingRegistrySaga::new(
                    Arc::clone(&b.ping.commands),
                    Arc::clone(&b.pinger),
                )),
            )),
            WorkflowKind::SplitRoot => Box::new(EventSourced::new(
                Arc::clone(&b.split.events),
                WorkflowActivity::new(SplitRootSaga::new(
                    Arc::clone(&b.split.commands),
                    Arc::clone(&b.du_tool),
                    settings,
                )),
            )),
            WorkflowKind::DuRoot => Box::new(EventSourced::new(
                Arc::clone(&b.du.events),
                WorkflowActivity::new(DuRootSaga::new(
                    Arc::clone(&b.du.commands),
                    Arc::clone(&b.du_tool),
                    settings,
                )),
            )),
        }
    }
}

impl WorkflowStarter for WorkflowFactory {
    fn start(
        &self,
        kind: WorkflowKind,
        workflow: EntityId,
        repo: Option<EntityId>,
    ) -> Result<(), EngineError> {
        let engine = self.engine.upgrade().ok_or(EngineError::Cancelled)?;
        let class = kind.class();
        let runnable = self.runnable(kind);

        let Some(repo) = repo.filter(|_| kind.is_repo_level()) else {
            engine.start_activity(workflow, class, runnable)?;
            info!(kind = %kind, workflow = %workflow, "Workflow started");
            return Ok(());
        };

        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        chains.retain(|_, done| !done.is_done());
        let completion = match chains.get(&repo) {
            Some(upstream) => {
                debug!(kind = %kind, workflow = %workflow, repo = %repo, "Chaining after running workflow");
                engine.start_activity_after(workflow, class, runnable, upstream.clone())?
            }
            None => engine.start_activity(workflow, class, runnable)?,
        };
        chains.insert(repo, completion);
        info!(kind = %kind, workflow = %workflow, repo = %repo, "Workflow started");
        Ok(())
    }
}
