//! # fso-orchestrator
//!
//! Workflow orchestration for a file-storage system. Each running workflow
//! is an activity bound to its aggregate's event stream; the [`Engine`]
//! schedules activities under per-class limits and wakes them on signals,
//! polls, or open streams. Workflow sagas replay their history into a view
//! and issue the next command from it.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod activity;
pub mod classify;
pub mod clients;
pub mod engine;
pub mod error;
pub mod index;
pub mod telemetry;
pub mod workflow;
pub mod workflows;

pub use activity::{Activity, ActivityClass, ActivityContext, EventSourced, Runnable};
pub use classify::{ClientError, RpcCode};
pub use clients::Status;
pub use engine::{Completion, Engine, TaskState, WeakEngine};
pub use error::{ActivityError, ActivityResult, EngineError};
pub use index::{IndexEntry, IndexEvent, IndexSaga, start_index};
pub use telemetry::init_tracing;
pub use workflow::{Saga, Step, WorkflowActivity};
pub use workflows::{Backends, WorkflowBackend, WorkflowFactory, WorkflowKind, WorkflowStarter};
