//! Activities: units of work bound to one entity's event stream.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fso_core::Clock;
use fso_events::{EntityId, EventId, EventSource, EventStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ActivityError, ActivityResult};

/// Limiter pool an activity draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityClass {
    /// Registry indexes; these never complete.
    Registry,
    Repo,
    Workflow,
}

impl ActivityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Repo => "repo",
            Self::Workflow => "workflow",
        }
    }
}

impl fmt::Display for ActivityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run context handed to an activity.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    entity: EntityId,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl ActivityContext {
    pub fn new(entity: EntityId, cancel: CancellationToken, clock: Arc<dyn Clock>) -> Self {
        Self {
            entity,
            cancel,
            clock,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Await `fut` unless the run is cancelled first.
    ///
    /// Every remote call and tool invocation goes through here so a shutdown
    /// never waits on a slow peer.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ActivityError>
    where
        F: Future + Send,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ActivityError::Cancelled),
            output = fut => Ok(output),
        }
    }
}

/// Consumes one entity's event stream.
#[async_trait]
pub trait Activity: Send {
    /// Payload type of the entity's events.
    type Event: Send + 'static;

    /// Process events from `stream`, which starts after `tail`.
    ///
    /// Returns the cursor after the last event processed, and `Ok(())` once
    /// the activity is finished for good.
    async fn process_events(
        &mut self,
        ctx: &ActivityContext,
        tail: EventId,
        stream: EventStream<Self::Event>,
    ) -> (EventId, ActivityResult);
}

/// An activity together with the source of its events; what the engine runs.
#[async_trait]
pub trait Runnable: Send {
    /// Open a stream at `tail` and process it.
    async fn run(&mut self, ctx: &ActivityContext, tail: EventId, watch: bool)
    -> (EventId, ActivityResult);
}

/// Binds an [`Activity`] to an [`EventSource`].
pub struct EventSourced<A: Activity> {
    source: Arc<dyn EventSource<A::Event>>,
    activity: A,
}

impl<A: Activity> EventSourced<A> {
    pub fn new(source: Arc<dyn EventSource<A::Event>>, activity: A) -> Self {
        Self { source, activity }
    }

    pub fn activity(&self) -> &A {
        &self.activity
    }
}

#[async_trait]
impl<A: Activity> Runnable for EventSourced<A> {
    async fn run(
        &mut self,
        ctx: &ActivityContext,
        tail: EventId,
        watch: bool,
    ) -> (EventId, ActivityResult) {
        let opened = match ctx
            .run(self.source.events(ctx.entity(), tail, watch))
            .await
        {
            Ok(opened) => opened,
            Err(cancelled) => return (tail, Err(cancelled)),
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                debug!(entity = %ctx.entity(), tail = %tail, error = %e, "Opening event stream failed");
                return (tail, Err(ActivityError::from(e)));
            }
        };
        self.activity.process_events(ctx, tail, stream).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fso_core::SystemClock;
    use std::time::Duration;

    fn ctx() -> ActivityContext {
        ActivityContext::new(
            EntityId::new(),
            CancellationToken::new(),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_run_returns_future_output() {
        let ctx = ctx();
        let value = ctx.run(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let ctx = ctx();
        ctx.cancel_token().cancel();
        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(3600)))
            .await;
        assert_eq!(result, Err(ActivityError::Cancelled));
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_class_names() {
        assert_eq!(ActivityClass::Registry.to_string(), "registry");
        assert_eq!(ActivityClass::Repo.as_str(), "repo");
        assert_eq!(ActivityClass::Workflow.as_str(), "workflow");
    }
}
