//! Activity outcomes and engine errors.

use chrono::{DateTime, Utc};
use fso_events::EntityId;
use thiserror::Error;

use crate::classify::{ClientError, RpcCode};

/// Why an activity returned without completing.
///
/// The engine turns each variant into a scheduling decision; activities never
/// see how they are rescheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    /// Every available event was consumed; wait for a signal.
    #[error("end of stream")]
    EndOfStream,

    /// Shutdown in progress.
    #[error("cancelled")]
    Cancelled,

    /// Expected waiting condition; retry on the next sweep without logging.
    #[error("silent retry")]
    SilentRetry,

    /// Expected waiting condition; retry without logging once `.0` has passed.
    #[error("silent retry after {0}")]
    SilentRetryAfter(DateTime<Utc>),

    /// Transient failure; retry with backoff.
    #[error("{0}")]
    Failed(String),
}

impl ActivityError {
    /// Create a transient failure.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    /// Whether the engine retries this without logging.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::SilentRetry | Self::SilentRetryAfter(_))
    }
}

impl From<fso_events::Error> for ActivityError {
    fn from(err: fso_events::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<ClientError> for ActivityError {
    fn from(err: ClientError) -> Self {
        match err.code {
            RpcCode::Cancelled => Self::Cancelled,
            _ => Self::Failed(err.to_string()),
        }
    }
}

/// Result of one activity run.
pub type ActivityResult = std::result::Result<(), ActivityError>;

/// Errors reported by the scheduling engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine was cancelled and has drained.
    #[error("engine cancelled")]
    Cancelled,

    /// An activity is already registered for the entity.
    #[error("activity already registered for {entity}")]
    DuplicateTask { entity: EntityId },
}

impl EngineError {
    /// Create a duplicate task error.
    pub fn duplicate_task(entity: EntityId) -> Self {
        Self::DuplicateTask { entity }
    }
}
