//! Custom error types for taskline.
//!
//! Errors are grouped by how the engine reacts to them: ledger and
//! validation errors abort a run before any dispatch, attempt errors are
//! absorbed by the retry loop, and gate errors are logged and dropped.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for taskline operations
#[derive(Error, Debug)]
pub enum TasklineError {
    // =========================================================================
    // Ledger Errors
    // =========================================================================
    /// Ledger text could not be parsed
    #[error("Ledger parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Status value outside the closed set
    #[error("Invalid status '{value}' (expected pending, running, completed, failed or skipped)")]
    InvalidStatus { value: String },

    /// No task with the given id exists in the ledger
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// No question with the given id exists in the question ledger
    #[error("Question not found: {id}")]
    QuestionNotFound { id: String },

    /// Task block exists but cannot be patched
    #[error("Malformed task '{id}': {reason}")]
    MalformedTask { id: String, reason: String },

    // =========================================================================
    // Phase Validation Errors
    // =========================================================================
    /// Dependency refers to a task id that is not in the ledger
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    /// Dependency is not in a strictly earlier parallel group
    #[error(
        "Task '{task}' (group {task_group}) depends on '{dependency}' (group {dependency_group}); dependencies must be in an earlier group"
    )]
    DependencyOrderViolation {
        task: String,
        task_group: u32,
        dependency: String,
        dependency_group: u32,
    },

    // =========================================================================
    // Locking Errors
    // =========================================================================
    /// Lock could not be acquired in time
    #[error("Timed out after {}ms waiting for lock on {}", .timeout.as_millis(), .path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// No task is currently eligible to run
    #[error("No runnable task: every pending task is waiting on unfinished dependencies")]
    NoRunnableTask,

    /// Several tasks are eligible and none was named
    #[error("Multiple runnable tasks, specify one of: {}", .candidates.join(", "))]
    AmbiguousTask { candidates: Vec<String> },

    /// A single attempt at a task failed
    #[error("Task '{task}' attempt failed: {message}")]
    Attempt { task: String, message: String },

    /// A single attempt exceeded its time budget
    #[error("Task '{task}' timed out after {}s", .timeout.as_secs())]
    AttemptTimeout { task: String, timeout: Duration },

    /// The run was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// A post-phase gate failed
    #[error("Gate '{gate}' failed: {message}")]
    Gate { gate: String, message: String },

    // =========================================================================
    // Setup Errors
    // =========================================================================
    /// Missing required file
    #[error("Missing required file: {}", .path.display())]
    MissingFile { path: PathBuf },

    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TasklineError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a parse error
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Create an attempt error
    pub fn attempt(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Attempt {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Create a gate error
    pub fn gate(gate: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Gate {
            gate: gate.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error can be retried by the attempt loop
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Attempt { .. }
                | Self::AttemptTimeout { .. }
                | Self::LockTimeout { .. }
                | Self::Git { .. }
                | Self::Io(_)
                | Self::Other(_)
        )
    }

    /// Check if this error is fatal (should abort the run before dispatch)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::InvalidStatus { .. }
                | Self::UnknownDependency { .. }
                | Self::DependencyOrderViolation { .. }
                | Self::MissingFile { .. }
                | Self::Config { .. }
        )
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse { .. } | Self::InvalidStatus { .. } | Self::MalformedTask { .. } => 2,
            Self::UnknownDependency { .. } | Self::DependencyOrderViolation { .. } => 3,
            Self::LockTimeout { .. } => 4,
            Self::Cancelled => 5,
            Self::MissingFile { .. } => 6,
            Self::Config { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for taskline results
pub type Result<T> = std::result::Result<T, TasklineError>;
