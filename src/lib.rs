//! Taskline - phased task-graph execution for coding agents
//!
//! Runs a grouped, dependency-ordered task ledger against an LLM coding
//! agent with bounded concurrency, automatic retry, crash recovery and
//! durable progress tracking in a plain-text ledger.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`ledger`] - Ledger parsing, writing and locked status updates
//! - [`lock`] - Timeout-bounded advisory file locks
//! - [`phase`] - Grouping tasks into validated, ordered phases
//! - [`execution`] - Phase executor, retry loop, gates and run driver
//! - [`agent`] - Agent client abstraction and the `claude` CLI client
//! - [`prompt`] - Task instructions, briefings and gate prompts
//! - [`history`] - Attempt transcripts and phase summaries
//! - [`unit`] - On-disk layout of a unit
//! - [`vcs`] - Version-control checkpoints
//! - [`config`] - Configuration loading
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (mocks, fixtures)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskline::{ClaudeCliAgent, ExecConfig, ExecutionDriver, GitCheckpointer, UnitLayout};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ExecConfig::load(project)?;
//! let layout = UnitLayout::resolve(project, "auth");
//! let driver = ExecutionDriver::new(
//!     layout,
//!     &config,
//!     Arc::new(ClaudeCliAgent::new()),
//!     Arc::new(GitCheckpointer::new(project)),
//! );
//! let report = driver.run(&CancellationToken::new()).await?;
//! println!("{}", report.progress);
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod execution;
pub mod history;
pub mod ledger;
pub mod lock;
pub mod phase;
pub mod prompt;
pub mod testing;
pub mod unit;
pub mod vcs;

// Re-export commonly used types
pub use error::{Result, TasklineError};

pub use agent::{AgentClient, ClaudeCliAgent};
pub use config::{ExecConfig, GateConfig};
pub use execution::{
    ExecutionDriver, ExecutorConfig, PhaseExecutor, PhaseOutcome, PhaseReport, PhaseState,
    RunReport, TaskOutcome, TaskResult, TaskRunner,
};
pub use ledger::{Ledger, Progress, Task, TaskStatus};
pub use lock::{with_lock, with_read_lock, FileLock};
pub use phase::{build_phases, Phase};
pub use unit::UnitLayout;
pub use vcs::{Checkpointer, GitCheckpointer};
