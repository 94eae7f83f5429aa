//! Execution configuration loaded from `.taskline/settings.json`.
//!
//! # Example settings.json
//!
//! ```json
//! {
//!   "maxParallel": 4,
//!   "maxRetries": 1,
//!   "taskTimeoutSecs": 900,
//!   "model": "sonnet",
//!   "gates": { "harden": false }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TasklineError};

/// Directory under the project root holding units and settings.
pub const TASKLINE_DIR: &str = ".taskline";

fn default_max_parallel() -> usize {
    3
}

fn default_max_retries() -> u32 {
    2
}

fn default_task_timeout_secs() -> u64 {
    1800
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

/// Which post-phase gates run. The checkpoint commit always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub review: bool,
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default = "default_true")]
    pub harden: bool,
    #[serde(default = "default_true")]
    pub summarize: bool,
    #[serde(default = "default_true")]
    pub harvest_questions: bool,
    #[serde(default = "default_true")]
    pub align_docs: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::all()
    }
}

impl GateConfig {
    /// Every optional gate enabled.
    #[must_use]
    pub fn all() -> Self {
        Self {
            review: true,
            validate: true,
            harden: true,
            summarize: true,
            harvest_questions: true,
            align_docs: true,
        }
    }

    /// Every optional gate disabled (commit only).
    #[must_use]
    pub fn none() -> Self {
        Self {
            review: false,
            validate: false,
            harden: false,
            summarize: false,
            harvest_questions: false,
            align_docs: false,
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    /// Concurrent task attempts per phase (minimum 1)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Time budget for one attempt
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Ledger lock acquisition timeout
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Base delay before a retry, doubled per attempt (0 disables)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Model passed to the agent; agent default when unset
    #[serde(default)]
    pub model: Option<String>,

    /// Distill project context into a task-specific briefing first
    #[serde(default = "default_true")]
    pub briefing: bool,

    #[serde(default)]
    pub gates: GateConfig,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            task_timeout_secs: default_task_timeout_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            model: None,
            briefing: true,
            gates: GateConfig::default(),
        }
    }
}

impl ExecConfig {
    /// Load configuration from a project directory; defaults when absent.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::settings_path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: ExecConfig = serde_json::from_str(&content).map_err(|e| {
            TasklineError::config_with_path(format!("invalid settings: {e}"), path.clone())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the settings.json path for a project
    #[must_use]
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(TASKLINE_DIR).join("settings.json")
    }

    /// Reject values that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.task_timeout_secs == 0 {
            return Err(TasklineError::config("taskTimeoutSecs must be greater than 0"));
        }
        if self.lock_timeout_ms == 0 {
            return Err(TasklineError::config("lockTimeoutMs must be greater than 0"));
        }
        Ok(())
    }

    /// Worker pool size, never below 1.
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        self.max_parallel.max(1)
    }

    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ExecConfig::default();
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert!(config.briefing);
        assert!(config.gates.review);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        assert_eq!(ExecConfig::load(temp.path()).unwrap(), ExecConfig::default());
    }

    #[test]
    fn test_load_partial_settings() {
        let temp = TempDir::new().unwrap();
        let path = ExecConfig::settings_path(temp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{ "maxParallel": 8, "model": "sonnet", "gates": { "harden": false } }"#,
        )
        .unwrap();

        let config = ExecConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.model.as_deref(), Some("sonnet"));
        assert!(!config.gates.harden);
        assert!(config.gates.review);
    }

    #[test]
    fn test_load_invalid_json_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = ExecConfig::settings_path(temp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let err = ExecConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, TasklineError::Config { path: Some(_), .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ExecConfig {
            task_timeout_secs: 0,
            ..ExecConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_parallelism_floor() {
        let config = ExecConfig {
            max_parallel: 0,
            ..ExecConfig::default()
        };
        assert_eq!(config.effective_parallelism(), 1);
    }
}
