//! ping-registry: check that every host expected by a registry answers.
//!
//! One host is pinged per step and its outcome recorded before the next, so a
//! restarted workflow resumes with the first unrecorded host.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fso_events::{EntityId, EventId, Result as EventResult, View, Vid, advance};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::activity::ActivityContext;
use crate::clients::{HostPinger, Status, WorkflowClient, WorkflowCommand};
use crate::error::ActivityError;
use crate::workflow::{Saga, Step};
use crate::workflows::common::submit;

const KIND: &str = "ping-registry";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PingState {
    #[default]
    Uninitialized,
    Initialized,
    Summarized,
    Completed,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingOutcome {
    Reachable { latency_ms: u64 },
    Unreachable { message: String },
}

impl PingOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingEvent {
    Started {
        registry: EntityId,
        hosts: Vec<String>,
    },
    PingRecorded {
        host: String,
        outcome: PingOutcome,
    },
    Summarized {
        reachable: usize,
        unreachable: usize,
    },
    Completed,
    Failed { status: Status },
    Terminated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingCommand {
    RecordPing { host: String, outcome: PingOutcome },
    Summarize { reachable: usize, unreachable: usize },
    Commit,
}

impl WorkflowCommand for PingCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::RecordPing { .. } => "RecordPing",
            Self::Summarize { .. } => "Summarize",
            Self::Commit => "Commit",
        }
    }
}

impl PingCommand {
    pub fn into_event(self) -> PingEvent {
        match self {
            Self::RecordPing { host, outcome } => PingEvent::PingRecorded { host, outcome },
            Self::Summarize {
                reachable,
                unreachable,
            } => PingEvent::Summarized {
                reachable,
                unreachable,
            },
            Self::Commit => PingEvent::Completed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingView {
    pub vid: Vid,
    pub state: PingState,
    pub registry: Option<EntityId>,
    pub hosts: Vec<String>,
    pub outcomes: BTreeMap<String, PingOutcome>,
}

impl PingView {
    /// First expected host without a recorded outcome.
    pub fn next_host(&self) -> Option<&str> {
        self.hosts
            .iter()
            .find(|h| !self.outcomes.contains_key(*h))
            .map(String::as_str)
    }
}

impl View for PingView {
    type Event = PingEvent;

    fn load_event(&mut self, id: EventId, event: &PingEvent) -> EventResult<()> {
        let started = matches!(event, PingEvent::Started { .. });
        if started != (self.state == PingState::Uninitialized) {
            return Err(fso_events::Error::invalid_event(format!(
                "{KIND}: {event:?} in state {:?}",
                self.state
            )));
        }

        let next = match event {
            PingEvent::Started { registry, hosts } => {
                self.registry = Some(*registry);
                self.hosts = hosts.clone();
                PingState::Initialized
            }
            PingEvent::PingRecorded { host, outcome } => {
                self.outcomes.insert(host.clone(), outcome.clone());
                self.state
            }
            PingEvent::Summarized { .. } => PingState::Summarized,
            PingEvent::Completed => PingState::Completed,
            PingEvent::Failed { .. } => PingState::Failed,
            PingEvent::Terminated { .. } => PingState::Terminated,
        };
        advance(&mut self.state, next);
        advance(&mut self.vid, Vid::from(id));
        Ok(())
    }

    fn vid(&self) -> Vid {
        self.vid
    }
}

pub struct PingRegistrySaga {
    view: PingView,
    commands: Arc<dyn WorkflowClient<PingCommand>>,
    pinger: Arc<dyn HostPinger>,
}

impl PingRegistrySaga {
    pub fn new(commands: Arc<dyn WorkflowClient<PingCommand>>, pinger: Arc<dyn HostPinger>) -> Self {
        Self {
            view: PingView::default(),
            commands,
            pinger,
        }
    }

    async fn send(&mut self, ctx: &ActivityContext, command: PingCommand) -> Result<Step, ActivityError> {
        let event = command.clone().into_event();
        submit(ctx, self.commands.as_ref(), &mut self.view, command, event).await
    }

    async fn ping_next(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        let Some(host) = self.view.next_host().map(str::to_owned) else {
            let reachable = self.view.outcomes.values().filter(|o| o.is_reachable()).count();
            let unreachable = self.view.outcomes.len() - reachable;
            info!(
                workflow = %ctx.entity(),
                reachable,
                unreachable,
                "Registry ping summarized"
            );
            return self
                .send(
                    ctx,
                    PingCommand::Summarize {
                        reachable,
                        unreachable,
                    },
                )
                .await;
        };

        let outcome = match ctx.run(self.pinger.ping(&host)).await? {
            Ok(latency) => PingOutcome::Reachable {
                latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            },
            Err(err) => PingOutcome::Unreachable {
                message: err.to_string(),
            },
        };
        debug!(workflow = %ctx.entity(), host = %host, ?outcome, "Ping recorded");
        self.send(ctx, PingCommand::RecordPing { host, outcome }).await
    }
}

#[async_trait]
impl Saga for PingRegistrySaga {
    type Event = PingEvent;
    type View = PingView;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn view(&self) -> &PingView {
        &self.view
    }

    fn view_mut(&mut self) -> &mut PingView {
        &mut self.view
    }

    async fn process_view(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError> {
        match self.view.state {
            PingState::Uninitialized => Ok(Step::Wait),
            PingState::Initialized => self.ping_next(ctx).await,
            PingState::Summarized => {
                self.send(ctx, PingCommand::Commit).await?;
                Ok(Step::Done)
            }
            PingState::Completed | PingState::Failed | PingState::Terminated => Ok(Step::Done),
        }
    }
}
