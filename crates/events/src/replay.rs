//! Folding events into views.
//!
//! A [`View`] is the in-memory state derived from one entity's events. Views
//! only move forward: [`replay`] skips every event at or before the view's
//! current version, so re-delivered events are harmless.

use crate::error::Result;
use crate::event::Event;
use crate::types::{EventId, Vid};

/// State derived by folding an entity's events.
pub trait View {
    /// Payload type of the entity's events.
    type Event;

    /// Fold one event into the view.
    ///
    /// Implementations record `id` as their new version, typically through
    /// [`advance`].
    fn load_event(&mut self, id: EventId, event: &Self::Event) -> Result<()>;

    /// Version of the last folded event.
    fn vid(&self) -> Vid;
}

/// Fold `events` into `view`, skipping the ones it has already seen.
///
/// Returns the cursor after the fold: the last event ID folded, or the
/// view's version if nothing new was delivered.
pub fn replay<V: View>(view: &mut V, events: &[Event<V::Event>]) -> Result<EventId> {
    let mut cursor = view.vid().as_event_id();
    for event in events {
        if event.id <= cursor {
            continue;
        }
        view.load_event(event.id, &event.payload)?;
        cursor = event.id;
    }
    Ok(cursor)
}

/// Move `current` forward to `next`; never backwards.
///
/// Returns whether `current` changed.
pub fn advance<S: Ord + Copy>(current: &mut S, next: S) -> bool {
    if next > *current {
        *current = next;
        true
    } else {
        false
    }
}
