//! Saga driver shared by every workflow kind.
//!
//! A [`Saga`] owns a [`View`] and a step function. [`WorkflowActivity`] feeds
//! it events in two modes:
//!
//! - **batch replay**: the first run folds the whole history without side
//!   effects, so steps that already happened are not issued again;
//! - **watch**: afterwards every batch is folded and the step function runs
//!   once after the batch.
//!
//! The step function runs at most once per view version. A step that issued
//! a command and is waiting for its event must not be re-entered just because
//! the stream went quiet again; only a new event, or a failed step, clears
//! the guard.

use async_trait::async_trait;
use fso_events::{EventId, EventStream, View, Vid, advance, replay};
use futures::StreamExt;
use tracing::{debug, trace};

use crate::activity::{Activity, ActivityContext};
use crate::error::{ActivityError, ActivityResult};

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The view advanced; run the next step right away.
    Continue,
    /// Nothing to do until a new event arrives.
    Wait,
    /// The workflow is finished.
    Done,
}

/// A workflow kind: its view and its step function.
#[async_trait]
pub trait Saga: Send {
    type Event: Send + Sync + 'static;
    type View: View<Event = Self::Event> + Send;

    /// Name used in logs.
    fn kind(&self) -> &'static str;

    fn view(&self) -> &Self::View;

    fn view_mut(&mut self) -> &mut Self::View;

    /// Decide and execute the next action for the current view.
    async fn process_view(&mut self, ctx: &ActivityContext) -> Result<Step, ActivityError>;
}

/// Runs a [`Saga`] as an [`Activity`].
pub struct WorkflowActivity<S> {
    saga: S,
    replayed: bool,
    last_processed: Option<Vid>,
}

impl<S: Saga> WorkflowActivity<S> {
    pub fn new(saga: S) -> Self {
        Self {
            saga,
            replayed: false,
            last_processed: None,
        }
    }

    pub fn saga(&self) -> &S {
        &self.saga
    }

    /// The stream has nothing more right now; act on the view.
    ///
    /// Runs the step function repeatedly while it makes progress. Returns
    /// whether the workflow is done.
    pub async fn will_block(&mut self, ctx: &ActivityContext) -> Result<bool, ActivityError> {
        loop {
            let vid = self.saga.view().vid();
            if self.last_processed == Some(vid) {
                trace!(kind = self.saga.kind(), vid = %vid, "View already processed");
                return Ok(false);
            }

            match self.saga.process_view(ctx).await {
                Ok(Step::Done) => {
                    debug!(kind = self.saga.kind(), entity = %ctx.entity(), vid = %vid, "Workflow done");
                    return Ok(true);
                }
                Ok(Step::Wait) => {
                    self.last_processed = Some(vid);
                    return Ok(false);
                }
                Ok(Step::Continue) => {
                    if self.saga.view().vid() == vid {
                        self.last_processed = Some(vid);
                        return Ok(false);
                    }
                }
                Err(e) => {
                    self.last_processed = None;
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<S: Saga> Activity for WorkflowActivity<S> {
    type Event = S::Event;

    async fn process_events(
        &mut self,
        ctx: &ActivityContext,
        tail: EventId,
        mut stream: EventStream<S::Event>,
    ) -> (EventId, ActivityResult) {
        let mut cursor = tail;
        loop {
            let next = tokio::select! {
                biased;
                () = ctx.cancel_token().cancelled() => return (cursor, Err(ActivityError::Cancelled)),
                next = stream.next() => next,
            };
            let batch = match next {
                None => return (cursor, Err(ActivityError::EndOfStream)),
                Some(Err(e)) => return (cursor, Err(ActivityError::from(e))),
                Some(Ok(batch)) => batch,
            };

            if let Err(e) = replay(self.saga.view_mut(), &batch.events) {
                return (cursor, Err(ActivityError::from(e)));
            }
            if let Some(last) = batch.last_id() {
                advance(&mut cursor, last);
            }

            if !self.replayed {
                if !batch.will_block {
                    continue;
                }
                self.replayed = true;
                trace!(kind = self.saga.kind(), entity = %ctx.entity(), tail = %cursor, "Batch replay finished");
            }

            match self.will_block(ctx).await {
                Ok(true) => return (cursor, Ok(())),
                Ok(false) => {}
                Err(e) => return (cursor, Err(e)),
            }
        }
    }
}
