//! Event stream and signal broadcast interfaces.
//!
//! These are the consumer side of the streaming RPC: the engine only ever
//! opens a stream at a cursor and reads batches, or listens for signals
//! telling it which entities have new events.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::event::EventBatch;
use crate::types::{EntityId, EventId};

/// Server-streamed sequence of event batches.
pub type EventStream<P> = BoxStream<'static, Result<EventBatch<P>>>;

/// Stream of "entity has new events" notifications.
pub type SignalStream = BoxStream<'static, Result<EntityId>>;

/// Opens event streams for one aggregate type.
#[async_trait]
pub trait EventSource<P>: Send + Sync {
    /// Open the stream of `entity` after the cursor `after`.
    ///
    /// With `watch = false` the stream ends after the first batch with
    /// `will_block = true`; with `watch = true` it stays open and delivers
    /// further batches as events are appended.
    async fn events(&self, entity: EntityId, after: EventId, watch: bool)
    -> Result<EventStream<P>>;
}

/// Opens the signal broadcast.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Open a stream of entity IDs that have new events.
    async fn signals(&self) -> Result<SignalStream>;
}
