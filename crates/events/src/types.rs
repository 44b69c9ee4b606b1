//! Identifier types: entities, event cursors, and version tokens.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Opaque identifier of a registry, repository, or workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Create a new random entity ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event cursor: the ID of an event in an entity's stream.
///
/// IDs are ULIDs, so they sort by creation time. [`EventId::NIL`] sorts
/// before every real event and means "from the beginning".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// The cursor before the first event.
    pub const NIL: Self = Self(Ulid::nil());

    /// Create from a ULID.
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get the inner ULID.
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Whether this is [`EventId::NIL`].
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Creation time encoded in the ID.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let time: SystemTime = self.0.datetime();
        DateTime::<Utc>::from(time)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::NIL
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimistic-concurrency version token of an aggregate.
///
/// The version of an aggregate is the ID of its last event, so a command
/// that succeeds returns the ID of the event it appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Vid(Ulid);

impl Vid {
    /// Version of an aggregate without events.
    pub const NIL: Self = Self(Ulid::nil());

    /// Create from a ULID.
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// The event ID this version refers to.
    pub const fn as_event_id(&self) -> EventId {
        EventId(self.0)
    }

    /// Whether this is [`Vid::NIL`].
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for Vid {
    fn default() -> Self {
        Self::NIL
    }
}

impl From<EventId> for Vid {
    fn from(id: EventId) -> Self {
        Self(id.0)
    }
}

impl std::fmt::Display for Vid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
