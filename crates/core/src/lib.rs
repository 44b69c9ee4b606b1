//! Core types shared by the fso crates: configuration, errors, and clock.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    Config, Discipline, EngineSettings, LimitSettings, LoggingSettings, SplitRootSettings,
    WorkflowSettings,
};
pub use error::{Error, Result};
