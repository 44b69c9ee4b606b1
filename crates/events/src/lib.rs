//! Event-sourcing plumbing for the fso workflow engine.
//!
//! - **Identifiers**: entity IDs, event cursors, and version tokens
//! - **Streams**: the [`EventSource`] and [`SignalSource`] contracts
//! - **Views**: forward-only folding of events with [`replay`]
//! - **Store**: an in-memory implementation of both contracts
//!
//! # Example
//!
//! ```ignore
//! use fso_events::{EntityId, EventId, EventSource, InMemoryEventStore};
//! use futures::StreamExt;
//!
//! let store = InMemoryEventStore::new();
//! let repo = EntityId::new();
//! store.append(repo, None, "archived").await?;
//!
//! let mut stream = store.events(repo, EventId::NIL, false).await?;
//! while let Some(batch) = stream.next().await {
//!     println!("{} events", batch?.events.len());
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod event;
pub mod replay;
pub mod store;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use event::{Event, EventBatch};
pub use replay::{View, advance, replay};
pub use store::{InMemoryEventStore, SignalHub};
pub use stream::{EventSource, EventStream, SignalSource, SignalStream};
pub use types::{EntityId, EventId, Vid};
