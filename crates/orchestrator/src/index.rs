//! Workflow index activity: discovers the workflows of one registry and
//! starts an activity for each.
//!
//! The index stream lists workflow starts and completions. After batch replay
//! every outstanding workflow is started; in watch mode new starts are picked
//! up as they arrive. A workflow is never started twice by the same index.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fso_events::{EntityId, EventId, EventSource, Result as EventResult, View, Vid, advance};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::activity::{ActivityClass, ActivityContext, EventSourced};
use crate::engine::{Completion, Engine};
use crate::error::{ActivityError, EngineError};
use crate::workflow::{Saga, Step, WorkflowActivity};
use crate::workflows::{WorkflowKind, WorkflowStarter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub kind: WorkflowKind,
    pub workflow_id: EntityId,
    /// Repository of a repo-level workflow.
    pub repo_id: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexEvent {
    /// Full list of outstanding workflows; replaces everything before it.
    Snapshot { entries: Vec<IndexEntry> },
    Started(IndexEntry),
    Completed { workflow_id: EntityId },
}

/// Outstanding workflows of one registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexView {
    pub vid: Vid,
    pub outstanding: OrdMap<EntityId, IndexEntry>,
}

impl IndexView {
    /// Outstanding workflow IDs of one kind.
    pub fn ids(&self, kind: WorkflowKind) -> Vec<EntityId> {
        self.outstanding
            .values()
            .filter(|e| e.kind == kind)
            .map(|e| e.workflow_id)
            .collect()
    }
}

impl View for IndexView {
    type Event = IndexEvent;

    fn load_event(&mut self, id: EventId, event: &IndexEvent) -> EventResult<()> {
        match event {
            IndexEvent::Snapshot { entries } => {
                self.outstanding = entries.iter().map(|e| (e.workflow_id, *e)).collect();
            }
            IndexEvent::Started(entry) => {
                self.outstanding.insert(entry.workflow_id, *entry);
            }
            IndexEvent::Completed { workflow_id } => {
                self.outstanding.remove(workflow_id);
            }
        }
        advance(&mut self.vid, Vid::from(id));
        Ok(())
    }

    fn vid(&self) -> Vid {
        self.vid
    }
}

pub struct IndexSaga {
    view: IndexView,
    starter: Arc<dyn WorkflowStarter>,
    started: HashSet<EntityId>,
}

impl IndexSaga {
    pub fn new(starter: Arc<dyn WorkflowStarter>) -> Self {
        Self {
            view: IndexView::default(),
            starter,
            started: HashSet::new(),
        }
    }

    /// Outstanding workflows this index has started.
    pub fn started(&self) -> &HashSet<EntityId> {
        &self.started
    }
}

#[async_trait]
impl Saga for IndexSaga {
    type Event = IndexEvent;
    type View = IndexView;

    fn kind(&self) -> &'static str {
        "workflow-index"
    }

    fn view(&self) -> &IndexView {
        &self.view
    }

    fn view_mut(&mut self) -> &mut IndexView {
        &mut self.view
    }

    async fn process_view(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let outstanding = &self.view.outstanding;
        self.started.retain(|id| outstanding.contains_key(id));

        let pending: Vec<IndexEntry> = self
            .view
            .outstanding
            .values()
            .filter(|e| !self.started.contains(&e.workflow_id))
            .copied()
            .collect();

        for entry in pending {
            match self.starter.start(entry.kind, entry.workflow_id, entry.repo_id) {
                Ok(()) => {}
                Err(EngineError::DuplicateTask { entity }) => {
                    debug!(registry = %ctx.entity(), workflow = %entity, "Workflow already running");
                }
                Err(EngineError::Cancelled) => return Err(ActivityError::Cancelled),
            }
            self.started.insert(entry.workflow_id);
        }
        Ok(Step::Wait)
    }
}

/// Start the index activity of `registry`.
///
/// The index of a registry never completes; the returned [`Completion`] only
/// resolves if the activity is dropped.
pub fn start_index(
    engine: &Engine,
    registry: EntityId,
    events: Arc<dyn EventSource<IndexEvent>>,
    starter: Arc<dyn WorkflowStarter>,
) -> Result<Completion, EngineError> {
    let runnable = EventSourced::new(events, WorkflowActivity::new(IndexSaga::new(starter)));
    let completion = engine.start_activity(registry, ActivityClass::Registry, Box::new(runnable));
    if let Err(e) = &completion {
        warn!(registry = %registry, error = %e, "Index activity not started");
    }
    completion
}
