//! Event envelope and stream batches.

use serde::{Deserialize, Serialize};

use crate::types::EventId;

/// One event of an entity's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event<P> {
    /// ID of this event; also the entity's version after it.
    pub id: EventId,
    /// ID of the previous event of the same entity, or NIL.
    pub parent: EventId,
    /// Aggregate-specific payload.
    pub payload: P,
}

impl<P> Event<P> {
    /// Create an event.
    pub const fn new(id: EventId, parent: EventId, payload: P) -> Self {
        Self {
            id,
            parent,
            payload,
        }
    }
}

/// A batch of events as delivered by an event stream.
///
/// `will_block` is set on the last batch the server has right now: a
/// non-watch stream ends after it, a watch stream blocks until new events
/// are appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch<P> {
    pub events: Vec<Event<P>>,
    pub will_block: bool,
}

impl<P> EventBatch<P> {
    /// Create a batch.
    pub const fn new(events: Vec<Event<P>>, will_block: bool) -> Self {
        Self { events, will_block }
    }

    /// ID of the last event in the batch.
    pub fn last_id(&self) -> Option<EventId> {
        self.events.last().map(|e| e.id)
    }
}
