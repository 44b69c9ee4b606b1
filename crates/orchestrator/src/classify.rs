//! Classification of remote command failures.
//!
//! The remote services expose nothing beyond an RPC status code and a
//! message, so outcomes are classified next to the call site by code and by
//! matching known message fragments. Saga steps then decide locally whether
//! to continue, retry, or compensate.

use std::fmt;

use thiserror::Error;

/// RPC status code of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCode {
    Unknown,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    FailedPrecondition,
    Aborted,
    Unavailable,
    Internal,
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Cancelled => "cancelled",
            Self::InvalidArgument => "invalid argument",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::PermissionDenied => "permission denied",
            Self::FailedPrecondition => "failed precondition",
            Self::Aborted => "aborted",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error returned by a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc {code}: {message}")]
pub struct ClientError {
    pub code: RpcCode,
    pub message: String,
}

impl ClientError {
    /// Create a client error.
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The service could not be reached.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    /// The command was refused in the aggregate's current state.
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(RpcCode::FailedPrecondition, message)
    }

    /// The version token did not match.
    pub fn version_conflict(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Aborted, message)
    }

    /// The call was cancelled.
    pub fn cancelled() -> Self {
        Self::new(RpcCode::Cancelled, "cancelled")
    }
}

/// Messages of begin refusals that will not resolve by retrying.
const FATAL_BEGIN_MESSAGES: &[&str] = &[
    "unknown registry",
    "unknown repo",
    "repo is not active",
    "repo is archived",
    "repo is not archived",
    "repo is frozen",
    "repo is not frozen",
    "other workflow pending",
    "other op pending",
    "permission denied",
];

/// Messages of abort and commit refusals meaning the op was never pending.
const NOTHING_PENDING_MESSAGES: &[&str] = &[
    "no pending",
    "not pending",
    "nothing pending",
    "workflow id mismatch",
];

fn mentions(err: &ClientError, fragments: &[&str]) -> bool {
    let message = err.message.to_lowercase();
    fragments.iter().any(|fragment| message.contains(fragment))
}

/// The version token was stale.
pub fn is_version_conflict(err: &ClientError) -> bool {
    err.code == RpcCode::Aborted || err.message.to_lowercase().contains("version conflict")
}

/// A begin step was refused permanently; compensate.
pub fn is_fatal_begin(err: &ClientError) -> bool {
    match err.code {
        RpcCode::NotFound | RpcCode::PermissionDenied | RpcCode::InvalidArgument => true,
        RpcCode::FailedPrecondition => true,
        _ => mentions(err, FATAL_BEGIN_MESSAGES),
    }
}

/// An abort or commit found nothing pending; treat as success.
pub fn is_nothing_pending(err: &ClientError) -> bool {
    mentions(err, NOTHING_PENDING_MESSAGES)
}

/// Network or availability failure; retry with backoff.
pub fn is_transient(err: &ClientError) -> bool {
    match err.code {
        RpcCode::Unavailable | RpcCode::DeadlineExceeded | RpcCode::Internal | RpcCode::Unknown => {
            !is_fatal_begin(err) && !is_nothing_pending(err)
        }
        _ => false,
    }
}
