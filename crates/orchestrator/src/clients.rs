//! Remote services and external tools used by the sagas.
//!
//! Every remote aggregate is reached through one of these traits, so the
//! transport stays outside the engine. Registry and repo commands are
//! idempotent by workflow ID; workflow commands carry the version token of
//! the workflow's view.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fso_events::{EntityId, Vid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::ClientError;

/// Longest status message stored on an aggregate.
pub const MAX_STATUS_MESSAGE_CHARS: usize = 120;

/// Outcome code and message persisted on an aggregate for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

impl Status {
    pub const OK: i32 = 0;
    pub const BEGIN_REFUSED: i32 = 10;
    pub const TOOL_FAILED: i32 = 20;
    pub const INTERRUPTED: i32 = 30;
    pub const ABORTED: i32 = 40;

    /// Create a status; the message is truncated to
    /// [`MAX_STATUS_MESSAGE_CHARS`] characters.
    pub fn new(code: i32, message: impl AsRef<str>) -> Self {
        let message: String = message
            .as_ref()
            .chars()
            .take(MAX_STATUS_MESSAGE_CHARS)
            .collect();
        Self { code, message }
    }

    /// Successful status.
    pub fn ok() -> Self {
        Self::new(Self::OK, "ok")
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Operation a workflow holds on a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepoOp {
    Archive,
    Unarchive,
    Freeze,
    Unfreeze,
}

impl fmt::Display for RepoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Archive => "archive",
            Self::Unarchive => "unarchive",
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
        };
        f.write_str(name)
    }
}

/// Access policy of a repository, recorded with archived files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPolicy {
    pub entries: Vec<String>,
}

/// Registry aggregate commands.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn begin_repo_op(
        &self,
        registry: EntityId,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
    ) -> Result<Vid, ClientError>;

    async fn commit_repo_op(
        &self,
        registry: EntityId,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
    ) -> Result<Vid, ClientError>;

    async fn abort_repo_op(
        &self,
        registry: EntityId,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
        status: &Status,
    ) -> Result<Vid, ClientError>;

    async fn repo_acl_policy(
        &self,
        registry: EntityId,
        repo: EntityId,
    ) -> Result<AclPolicy, ClientError>;
}

/// Repository aggregate commands.
#[async_trait]
pub trait ReposClient: Send + Sync {
    async fn begin_op(
        &self,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
    ) -> Result<Vid, ClientError>;

    async fn commit_op(
        &self,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
    ) -> Result<Vid, ClientError>;

    async fn abort_op(
        &self,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
        status: &Status,
    ) -> Result<Vid, ClientError>;
}

/// A command addressed to a workflow aggregate.
pub trait WorkflowCommand: Send + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Workflow aggregate commands of one workflow kind.
#[async_trait]
pub trait WorkflowClient<C>: Send + Sync {
    /// Apply `command` if `vid` is still the workflow's version.
    ///
    /// Returns the new version, which is the ID of the appended event.
    async fn command(&self, workflow: EntityId, vid: Vid, command: C) -> Result<Vid, ClientError>;
}

/// Failure of an external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tool} failed: {message}")]
pub struct ToolError {
    pub tool: &'static str,
    pub message: String,
}

impl ToolError {
    pub fn new(tool: &'static str, message: impl Into<String>) -> Self {
        Self {
            tool,
            message: message.into(),
        }
    }
}

/// Archive and restore of repository files.
#[async_trait]
pub trait ArchiveTool: Send + Sync {
    /// Write the repository's files to a tar archive; returns its path.
    async fn archive_tartt(
        &self,
        repo_path: &Path,
        working_dir: &Path,
        acl: &AclPolicy,
    ) -> Result<PathBuf, ToolError>;

    /// Replace the repository's files by the archive placeholder.
    async fn swap(&self, repo_path: &Path, working_dir: &Path) -> Result<(), ToolError>;

    /// Restore the repository's files from `tar_path`.
    async fn restore(
        &self,
        repo_path: &Path,
        tar_path: &Path,
        working_dir: &Path,
    ) -> Result<(), ToolError>;

    /// Delete a workflow's working directory.
    async fn remove_working_dir(&self, working_dir: &Path) -> Result<(), ToolError>;
}

/// Toggles write access to repository files.
#[async_trait]
pub trait FreezeTool: Send + Sync {
    async fn freeze(&self, repo_path: &Path) -> Result<(), ToolError>;
    async fn unfreeze(&self, repo_path: &Path) -> Result<(), ToolError>;
}

/// Usage of one directory below a scanned root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuEntry {
    /// Path relative to the root.
    pub path: PathBuf,
    /// Bytes used below `path`.
    pub usage: u64,
}

/// Directory-usage scanner.
#[async_trait]
pub trait DuTool: Send + Sync {
    async fn du(&self, root: &Path, max_depth: usize) -> Result<Vec<DuEntry>, ToolError>;
}

/// Liveness check of a worker host.
#[async_trait]
pub trait HostPinger: Send + Sync {
    async fn ping(&self, host: &str) -> Result<Duration, ToolError>;
}
