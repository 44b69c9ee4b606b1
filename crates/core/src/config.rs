//! Engine configuration loaded from TOML.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! Durations are stored as whole seconds and exposed as [`Duration`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the engine decides when a sleeping activity runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    /// Re-queue on push signals from the signal broadcast.
    #[default]
    Signal,
    /// Keep one blocking watch stream open per entity.
    AlwaysOpen,
    /// Re-queue every sleeping activity on a fixed interval.
    Polling,
}

impl std::fmt::Display for Discipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Signal => "signal",
            Self::AlwaysOpen => "always_open",
            Self::Polling => "polling",
        };
        write!(f, "{s}")
    }
}

/// Scheduling engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Scheduling discipline.
    pub discipline: Discipline,
    /// Retry sweep tick and backoff base.
    pub retry_interval_secs: u64,
    /// Upper bound for retry backoff.
    pub max_backoff_secs: u64,
    /// Poll sweep interval for the polling discipline.
    pub poll_interval_secs: u64,
    /// Delay before reconnecting a broken signal stream.
    pub signal_reconnect_secs: u64,
    /// Fallback interval at which every entity is re-signalled.
    pub resignal_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            discipline: Discipline::Signal,
            retry_interval_secs: 20,
            max_backoff_secs: 300,
            poll_interval_secs: 60,
            signal_reconnect_secs: 5,
            resignal_interval_secs: 600,
        }
    }
}

impl EngineSettings {
    /// Retry sweep interval.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Maximum retry backoff.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Signal reconnect delay.
    pub fn signal_reconnect(&self) -> Duration {
        Duration::from_secs(self.signal_reconnect_secs)
    }

    /// Broadcast re-signal interval.
    pub fn resignal_interval(&self) -> Duration {
        Duration::from_secs(self.resignal_interval_secs)
    }
}

/// Limiter pool sizes, one per activity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Concurrent registry-level activities.
    pub registry: usize,
    /// Concurrent repo-level activities.
    pub repo: usize,
    /// Concurrent workflow-level activities.
    pub workflow: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            registry: 8,
            repo: 32,
            workflow: 16,
        }
    }
}

/// split-root analysis thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitRootSettings {
    /// Deepest directory level considered for a split suggestion.
    pub max_depth: usize,
    /// Minimum usage for a directory to be suggested.
    pub min_usage_bytes: u64,
}

impl Default for SplitRootSettings {
    fn default() -> Self {
        Self {
            max_depth: 2,
            min_usage_bytes: 1 << 30,
        }
    }
}

/// Settings shared by the workflow sagas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Delay between files-ended and working directory removal.
    pub gc_delay_secs: u64,
    /// Consecutive external tool failures before escalating to abort.
    pub max_external_attempts: u32,
    /// Parent directory of per-workflow working directories.
    pub working_dir_root: PathBuf,
    /// du records per append command.
    pub du_batch_size: usize,
    /// split-root analysis.
    pub split_root: SplitRootSettings,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            gc_delay_secs: 7 * 24 * 3600,
            max_external_attempts: 5,
            working_dir_root: PathBuf::from("/var/lib/fso/work"),
            du_batch_size: 1000,
            split_root: SplitRootSettings::default(),
        }
    }
}

impl WorkflowSettings {
    /// GC delay.
    pub fn gc_delay(&self) -> Duration {
        Duration::from_secs(self.gc_delay_secs)
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive string.
    pub filter: String,
    /// Colored output.
    pub ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSettings,
    pub limits: LimitSettings,
    pub workflows: WorkflowSettings,
    pub logging: LoggingSettings,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| Error::config_read_failed(path, e.to_string()))?;
        let config = Self::from_toml_str(&input)?;
        tracing::debug!(path = %path.display(), discipline = %config.engine.discipline, "Loaded config");
        Ok(config)
    }

    /// Check limits and intervals.
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("limits.registry", self.limits.registry),
            ("limits.repo", self.limits.repo),
            ("limits.workflow", self.limits.workflow),
            ("workflows.du_batch_size", self.workflows.du_batch_size),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, v)| *v == 0) {
            return Err(Error::invalid_config(format!("{name} must be positive")));
        }

        let intervals = [
            ("engine.retry_interval_secs", self.engine.retry_interval_secs),
            ("engine.poll_interval_secs", self.engine.poll_interval_secs),
            ("engine.resignal_interval_secs", self.engine.resignal_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(Error::invalid_config(format!("{name} must be positive")));
        }

        if self.engine.max_backoff_secs < self.engine.retry_interval_secs {
            return Err(Error::invalid_config(
                "engine.max_backoff_secs must not be smaller than engine.retry_interval_secs",
            ));
        }
        if self.workflows.max_external_attempts == 0 {
            return Err(Error::invalid_config(
                "workflows.max_external_attempts must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engine.retry_interval(), Duration::from_secs(20));
        assert_eq!(config.workflows.gc_delay(), Duration::from_secs(604_800));
        assert_eq!(config.workflows.max_external_attempts, 5);
    }

    #[test]
    fn test_partial_sections_are_merged_with_defaults() {
        let config = Config::from_toml_str(
            r#"
            [engine]
            discipline = "always_open"
            retry_interval_secs = 2
            max_backoff_secs = 30

            [limits]
            repo = 4

            [workflows.split_root]
            max_depth = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.discipline, Discipline::AlwaysOpen);
        assert_eq!(config.engine.retry_interval_secs, 2);
        assert_eq!(config.engine.poll_interval_secs, 60);
        assert_eq!(config.limits.repo, 4);
        assert_eq!(config.limits.registry, 8);
        assert_eq!(config.workflows.split_root.max_depth, 3);
        assert_eq!(config.workflows.split_root.min_usage_bytes, 1 << 30);
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let err = Config::from_toml_str("[limits]\nworkflow = 0\n").unwrap_err();
        assert!(err.to_string().contains("limits.workflow"));
    }

    #[test]
    fn test_backoff_below_retry_interval_is_rejected() {
        let err = Config::from_toml_str(
            "[engine]\nretry_interval_secs = 60\nmax_backoff_secs = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_backoff_secs"));
    }

    #[test]
    fn test_unknown_discipline_is_a_parse_error() {
        let err = Config::from_toml_str("[engine]\ndiscipline = \"busy_loop\"\n").unwrap_err();
        assert!(matches!(err, Error::TomlParseFailed { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nfilter = \"fso=debug\"\nansi = false").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.logging.filter, "fso=debug");
        assert!(!config.logging.ansi);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/fso.toml").unwrap_err();
        assert!(matches!(err, Error::ConfigReadFailed { .. }));
    }
}
