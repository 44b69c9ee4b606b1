//! Error types for the events crate.

use std::fmt;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Opening or reading an event stream failed.
    StreamFailed { entity: String, reason: String },
    /// Optimistic-concurrency precondition did not hold.
    VersionConflict {
        entity: String,
        expected: String,
        actual: String,
    },
    /// An event cannot be folded into a view.
    InvalidEvent { reason: String },
    /// Channel closed.
    ChannelClosed,
    /// Internal error.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamFailed { entity, reason } => {
                write!(f, "event stream for '{entity}' failed: {reason}")
            }
            Self::VersionConflict {
                entity,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "version conflict on '{entity}': expected {expected}, actual {actual}"
                )
            }
            Self::InvalidEvent { reason } => {
                write!(f, "invalid event: {reason}")
            }
            Self::ChannelClosed => {
                write!(f, "event channel closed")
            }
            Self::Internal(msg) => {
                write!(f, "internal error: {msg}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a stream failed error.
    pub fn stream_failed(entity: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::StreamFailed {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a version conflict error.
    pub fn version_conflict(
        entity: impl fmt::Display,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::VersionConflict {
            entity: entity.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an invalid event error.
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Whether this is a version conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
