//! In-memory event store and signal hub.
//!
//! [`InMemoryEventStore`] is the reference implementation of the
//! [`EventSource`] contract: per-entity append-only logs with monotonic ULID
//! event IDs and optimistic concurrency on append. [`SignalHub`] is the
//! matching signal broadcast; stores created with a hub notify it on every
//! append.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, trace};
use ulid::Generator;

use crate::error::{Error, Result};
use crate::event::{Event, EventBatch};
use crate::stream::{EventSource, EventStream, SignalSource, SignalStream};
use crate::types::{EntityId, EventId, Vid};

/// Capacity of the internal append notification channels.
const NOTIFY_CAPACITY: usize = 1024;

/// Broadcast of entity IDs that received new events.
#[derive(Clone)]
pub struct SignalHub {
    sender: Arc<Mutex<broadcast::Sender<EntityId>>>,
}

impl SignalHub {
    /// Create a new hub.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            sender: Arc::new(Mutex::new(sender)),
        }
    }

    /// Announce new events for `entity`.
    pub fn notify(&self, entity: EntityId) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        // No subscribers is fine; signals are hints.
        let _ = sender.send(entity);
    }

    /// End every open signal stream.
    ///
    /// Subscribers see end-of-stream and have to reconnect.
    pub fn disconnect_all(&self) {
        let (sender, _) = broadcast::channel(NOTIFY_CAPACITY);
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    /// Number of open signal streams.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .receiver_count()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalSource for SignalHub {
    async fn signals(&self) -> Result<SignalStream> {
        let receiver = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();

        let signals = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(entity) => Some((Ok(entity), receiver)),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(Error::stream_failed(
                        "signals",
                        format!("lagged behind by {missed} signals"),
                    )),
                    receiver,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(signals.boxed())
    }
}

struct Inner<P> {
    streams: RwLock<HashMap<EntityId, Vec<Event<P>>>>,
    ids: Mutex<Generator>,
    appended: broadcast::Sender<EntityId>,
    hub: Option<SignalHub>,
    open_failures: AtomicUsize,
}

/// In-memory, per-entity event logs.
pub struct InMemoryEventStore<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for InMemoryEventStore<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> InMemoryEventStore<P>
where
    P: Clone + Send + Sync + 'static,
{
    /// Create a store without signal broadcast.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a store that notifies `hub` on every append.
    pub fn with_signal_hub(hub: SignalHub) -> Self {
        Self::build(Some(hub))
    }

    fn build(hub: Option<SignalHub>) -> Self {
        let (appended, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                streams: RwLock::new(HashMap::new()),
                ids: Mutex::new(Generator::new()),
                appended,
                hub,
                open_failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Append an event.
    ///
    /// With `expected = Some(vid)` the append only succeeds if `vid` is the
    /// entity's current version. Returns the new version.
    pub async fn append(&self, entity: EntityId, expected: Option<Vid>, payload: P) -> Result<Vid> {
        let id = {
            let mut streams = self.inner.streams.write().await;
            let events = streams.entry(entity).or_default();
            let current = events.last().map_or(EventId::NIL, |e| e.id);

            if let Some(expected) = expected {
                if expected.as_event_id() != current {
                    return Err(Error::version_conflict(entity, expected, current));
                }
            }

            let id = self.next_id()?;
            events.push(Event::new(id, current, payload));
            id
        };

        trace!(entity = %entity, event_id = %id, "Event appended");
        // Watch streams re-read the log on every notification.
        let _ = self.inner.appended.send(entity);
        if let Some(hub) = &self.inner.hub {
            hub.notify(entity);
        }
        Ok(Vid::from(id))
    }

    fn next_id(&self) -> Result<EventId> {
        let mut ids = self.inner.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.generate()
            .map(EventId::from_ulid)
            .map_err(|e| Error::Internal(format!("event id generation failed: {e}")))
    }

    /// Events of `entity` after the cursor `after`.
    pub async fn events_after(&self, entity: EntityId, after: EventId) -> Vec<Event<P>> {
        let streams = self.inner.streams.read().await;
        streams.get(&entity).map_or_else(Vec::new, |events| {
            events.iter().filter(|e| e.id > after).cloned().collect()
        })
    }

    /// All events of `entity`.
    pub async fn all(&self, entity: EntityId) -> Vec<Event<P>> {
        self.events_after(entity, EventId::NIL).await
    }

    /// Current version of `entity`.
    pub async fn version(&self, entity: EntityId) -> Vid {
        let streams = self.inner.streams.read().await;
        streams
            .get(&entity)
            .and_then(|events| events.last())
            .map_or(Vid::NIL, |e| Vid::from(e.id))
    }

    /// Make the next `count` stream opens fail.
    pub fn inject_open_failures(&self, count: usize) {
        self.inner.open_failures.store(count, Ordering::SeqCst);
    }

    fn take_open_failure(&self) -> bool {
        self.inner
            .open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<P> Default for InMemoryEventStore<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct WatchState<P> {
    store: InMemoryEventStore<P>,
    entity: EntityId,
    after: EventId,
    appended: broadcast::Receiver<EntityId>,
    primed: bool,
}

#[async_trait]
impl<P> EventSource<P> for InMemoryEventStore<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn events(
        &self,
        entity: EntityId,
        after: EventId,
        watch: bool,
    ) -> Result<EventStream<P>> {
        if self.take_open_failure() {
            return Err(Error::stream_failed(entity, "injected open failure"));
        }
        debug!(entity = %entity, after = %after, watch, "Opening event stream");

        if !watch {
            let events = self.events_after(entity, after).await;
            let batch = EventBatch::new(events, true);
            return Ok(stream::iter([Ok(batch)]).boxed());
        }

        // Subscribe before the first read so no append is missed.
        let state = WatchState {
            store: self.clone(),
            entity,
            after,
            appended: self.inner.appended.subscribe(),
            primed: false,
        };
        let batches = stream::unfold(state, |mut state| async move {
            loop {
                let events = state.store.events_after(state.entity, state.after).await;
                if !events.is_empty() || !state.primed {
                    state.primed = true;
                    let batch = EventBatch::new(events, true);
                    if let Some(last) = batch.last_id() {
                        state.after = last;
                    }
                    return Some((Ok(batch), state));
                }
                match state.appended.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(batches.boxed())
    }
}
