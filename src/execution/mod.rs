//! Phase execution: bounded-concurrency dispatch, retries and the run driver.
//!
//! # Architecture
//!
//! ```text
//! ExecutionDriver::run
//!   ├─ reset_running (crash recovery)
//!   ├─ build_phases
//!   └─ for each phase
//!        ├─ PhaseExecutor::run_phase ── tokio::spawn per task
//!        │     └─ semaphore permit ── execute_with_retry ── TaskRunner::run_task
//!        └─ PhaseGates (review, validate, harden, commit, summarize, harvest)
//! ```
//!
//! Each spawned task returns its own [`TaskResult`]; the join step merges
//! them into a [`PhaseOutcome`]. No result state is shared between workers.

pub mod driver;
pub mod gates;
pub mod retry;
pub mod runner;

pub use driver::{ExecutionDriver, PhaseReport, PhaseState, RunReport};
pub use gates::{GateKind, PhaseGates};
pub use retry::{calculate_backoff, execute_with_retry};
pub use runner::{resolve_task, TaskAttempt, TaskRunner};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExecConfig;
use crate::error::Result;
use crate::ledger::TaskStatus;
use crate::phase::Phase;

/// How a task ended in one phase execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// An attempt succeeded
    Completed,
    /// Already completed or skipped; not dispatched
    AlreadyDone { status: TaskStatus },
    /// A dependency is not completed; left pending, not dispatched
    Blocked { waiting_on: Vec<String> },
    /// Every attempt failed
    Failed { error: String },
    /// The run was cancelled before the task finished
    Cancelled,
}

/// Result of one task in a phase, returned by its worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub outcome: TaskOutcome,
    /// Attempts actually started
    pub attempts: u32,
    /// Transcript saved by the successful attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<PathBuf>,
}

impl TaskResult {
    #[must_use]
    pub fn completed(task_id: &str, attempts: u32) -> Self {
        Self::new(task_id, TaskOutcome::Completed, attempts)
    }

    #[must_use]
    pub fn failed(task_id: &str, attempts: u32, error: impl Into<String>) -> Self {
        Self::new(
            task_id,
            TaskOutcome::Failed {
                error: error.into(),
            },
            attempts,
        )
    }

    #[must_use]
    pub fn cancelled(task_id: &str, attempts: u32) -> Self {
        Self::new(task_id, TaskOutcome::Cancelled, attempts)
    }

    fn new(task_id: &str, outcome: TaskOutcome, attempts: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            outcome,
            attempts,
            transcript: None,
        }
    }

    #[must_use]
    pub fn with_transcript(mut self, transcript: Option<PathBuf>) -> Self {
        self.transcript = transcript;
        self
    }

    /// Whether the task is done after this phase.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            TaskOutcome::Completed | TaskOutcome::AlreadyDone { .. }
        )
    }

    /// Whether the task went through the worker pool.
    #[must_use]
    pub fn was_dispatched(&self) -> bool {
        matches!(
            self.outcome,
            TaskOutcome::Completed | TaskOutcome::Failed { .. } | TaskOutcome::Cancelled
        )
    }

    /// Error text of a failed task.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Merged results of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseOutcome {
    pub group: u32,
    /// One result per task, in ledger order
    pub results: Vec<TaskResult>,
}

impl PhaseOutcome {
    #[must_use]
    pub fn dispatched(&self) -> usize {
        self.results.iter().filter(|r| r.was_dispatched()).count()
    }

    /// Tasks completed by this execution.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == TaskOutcome::Completed)
            .count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Failed { .. }))
            .count()
    }

    #[must_use]
    pub fn blocked(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Blocked { .. }))
            .count()
    }

    /// Every dispatched task ended in error. A phase that dispatched
    /// nothing is not a total failure.
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.dispatched() > 0 && self.succeeded() == 0
    }

    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.outcome == TaskOutcome::Cancelled)
    }

    /// Transcripts saved by this execution, in ledger order.
    #[must_use]
    pub fn transcripts(&self) -> Vec<PathBuf> {
        self.results
            .iter()
            .filter_map(|r| r.transcript.clone())
            .collect()
    }
}

/// Knobs for [`PhaseExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Worker pool size, at least 1
    pub max_parallel: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Budget for each attempt
    pub task_timeout: Duration,
    /// Base wait before a retry
    pub retry_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ExecConfig::default())
    }
}

impl From<&ExecConfig> for ExecutorConfig {
    fn from(config: &ExecConfig) -> Self {
        Self {
            max_parallel: config.effective_parallelism(),
            max_retries: config.max_retries,
            task_timeout: config.task_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// Runs the tasks of one phase concurrently under a worker limit.
#[derive(Clone)]
pub struct PhaseExecutor {
    runner: Arc<TaskRunner>,
    config: ExecutorConfig,
}

impl PhaseExecutor {
    #[must_use]
    pub fn new(runner: Arc<TaskRunner>, config: ExecutorConfig) -> Self {
        Self { runner, config }
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[must_use]
    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Run every task of `phase` that is not already done.
    ///
    /// Statuses are re-read from the ledger first so earlier phases of the
    /// same run are taken into account. Completed and skipped tasks are
    /// recorded without dispatch; tasks with an unfinished dependency stay
    /// pending. Everything else is attempted, at most `max_parallel` at a
    /// time, in no particular order.
    ///
    /// # Errors
    ///
    /// Only a failure to read the ledger; task failures are part of the outcome.
    pub async fn run_phase(
        &self,
        phase: &Phase,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome> {
        let current = self.runner.ledger().load_async().await?;
        let statuses: HashMap<&str, TaskStatus> =
            current.iter().map(|t| (t.id.as_str(), t.status)).collect();

        let mut slots: Vec<Option<TaskResult>> = Vec::with_capacity(phase.tasks.len());
        let mut dispatch = Vec::new();

        for (index, task) in phase.tasks.iter().enumerate() {
            let status = statuses.get(task.id.as_str()).copied().unwrap_or(task.status);
            if status.is_done() {
                debug!("Task {} already {}, not dispatching", task.id, status);
                slots.push(Some(TaskResult::new(
                    &task.id,
                    TaskOutcome::AlreadyDone { status },
                    0,
                )));
                continue;
            }

            let waiting_on: Vec<String> = task
                .depends_on
                .iter()
                .filter(|dep| statuses.get(dep.as_str()) != Some(&TaskStatus::Completed))
                .cloned()
                .collect();
            if !waiting_on.is_empty() {
                warn!(
                    "Task {} is blocked on unfinished dependencies: {}",
                    task.id,
                    waiting_on.join(", ")
                );
                slots.push(Some(TaskResult::new(
                    &task.id,
                    TaskOutcome::Blocked { waiting_on },
                    0,
                )));
                continue;
            }

            slots.push(None);
            dispatch.push((index, task.id.clone()));
        }

        info!(
            "Phase {}: dispatching {} task(s) with {} worker(s)",
            phase.group,
            dispatch.len(),
            self.config.max_parallel.max(1)
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let handles: Vec<_> = dispatch
            .iter()
            .map(|(_, task_id)| {
                let semaphore = Arc::clone(&semaphore);
                let runner = Arc::clone(&self.runner);
                let config = self.config.clone();
                let cancel = cancel.clone();
                let task_id = task_id.clone();

                tokio::spawn(async move {
                    let _permit = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return TaskResult::cancelled(&task_id, 0),
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return TaskResult::failed(&task_id, 0, "worker pool closed"),
                        },
                    };
                    execute_with_retry(&runner, &task_id, &config, &cancel).await
                })
            })
            .collect();

        let joined = join_all(handles).await;

        for ((index, task_id), joined) in dispatch.into_iter().zip(joined) {
            let result = joined.unwrap_or_else(|e| {
                warn!("Worker for task {} panicked: {}", task_id, e);
                TaskResult::failed(&task_id, 0, format!("worker panicked: {e}"))
            });
            slots[index] = Some(result);
        }

        let results: Vec<TaskResult> = slots.into_iter().flatten().collect();
        let outcome = PhaseOutcome {
            group: phase.group,
            results,
        };
        info!(
            "Phase {} finished: {} completed, {} failed, {} blocked",
            phase.group,
            outcome.succeeded(),
            outcome.failed(),
            outcome.blocked()
        );
        Ok(outcome)
    }
}
