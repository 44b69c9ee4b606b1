//! Core error types for fso setup and configuration.
//!
//! All errors are explicit and typed; nothing in this crate panics.

use std::path::PathBuf;

use thiserror::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for configuration and process setup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file '{path}': {reason}")]
    ConfigReadFailed { path: PathBuf, reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to initialize tracing: {reason}")]
    TracingInitFailed { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config read error.
    pub fn config_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a tracing initialization error.
    pub fn tracing_init_failed(reason: impl Into<String>) -> Self {
        Self::TracingInitFailed {
            reason: reason.into(),
        }
    }
}
