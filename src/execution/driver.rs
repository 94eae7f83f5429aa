//! Whole-run state machine.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::gates::PhaseGates;
use super::runner::TaskRunner;
use super::{ExecutorConfig, PhaseExecutor, PhaseOutcome, TaskResult};
use crate::agent::AgentClient;
use crate::config::ExecConfig;
use crate::error::Result;
use crate::ledger::{Ledger, Progress};
use crate::phase::{build_phases, Phase};
use crate::unit::UnitLayout;
use crate::vcs::Checkpointer;

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseState {
    /// Every task was already done; nothing dispatched
    Skipped,
    /// Every task is done
    Completed,
    /// Some tasks completed, others failed or are blocked
    Partial,
    /// Every dispatched task failed; gates skipped
    Failed,
    /// Nothing could be dispatched because of unfinished dependencies
    Blocked,
    /// The run was cancelled during this phase
    Cancelled,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseState::Skipped => "skipped",
            PhaseState::Completed => "completed",
            PhaseState::Partial => "partial",
            PhaseState::Failed => "failed",
            PhaseState::Blocked => "blocked",
            PhaseState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-phase line of the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub group: u32,
    pub state: PhaseState,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    /// Checkpoint made after the phase
    pub commit: Option<String>,
    pub tasks: Vec<TaskResult>,
}

impl PhaseReport {
    fn skipped(phase: &Phase) -> Self {
        Self {
            group: phase.group,
            state: PhaseState::Skipped,
            succeeded: 0,
            failed: 0,
            blocked: 0,
            commit: None,
            tasks: Vec::new(),
        }
    }

    fn from_outcome(outcome: PhaseOutcome, commit: Option<String>) -> Self {
        let state = if outcome.was_cancelled() {
            PhaseState::Cancelled
        } else if outcome.is_total_failure() {
            PhaseState::Failed
        } else if outcome.dispatched() == 0 && outcome.blocked() > 0 {
            PhaseState::Blocked
        } else if outcome.failed() > 0 || outcome.blocked() > 0 {
            PhaseState::Partial
        } else {
            PhaseState::Completed
        };

        Self {
            group: outcome.group,
            state,
            succeeded: outcome.succeeded(),
            failed: outcome.failed(),
            blocked: outcome.blocked(),
            commit,
            tasks: outcome.results,
        }
    }
}

/// Summary of one `execute` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub phases: Vec<PhaseReport>,
    /// Ledger progress after the run
    pub progress: Progress,
    /// Tasks reset from `running` at startup
    pub recovered: Vec<String>,
    /// Checkpoint made by the documentation pass
    pub docs_commit: Option<String>,
    pub cancelled: bool,
}

impl RunReport {
    /// Phase checkpoints made during the run.
    #[must_use]
    pub fn commits(&self) -> Vec<&str> {
        self.phases
            .iter()
            .filter_map(|p| p.commit.as_deref())
            .collect()
    }

    #[must_use]
    pub fn failed_tasks(&self) -> usize {
        self.phases.iter().map(|p| p.failed).sum()
    }
}

/// Runs a unit's phases in order with recovery and gates.
pub struct ExecutionDriver {
    layout: UnitLayout,
    ledger: Ledger,
    executor: PhaseExecutor,
    gates: PhaseGates,
    checkpointer: Arc<dyn Checkpointer>,
}

impl ExecutionDriver {
    #[must_use]
    pub fn new(
        layout: UnitLayout,
        config: &ExecConfig,
        agent: Arc<dyn AgentClient>,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Self {
        let runner = Arc::new(TaskRunner::new(layout.clone(), Arc::clone(&agent), config));
        let ledger = runner.ledger().clone();
        let executor = PhaseExecutor::new(runner, ExecutorConfig::from(config));
        let gates = PhaseGates::new(&layout, agent, Arc::clone(&checkpointer), config);
        Self {
            layout,
            ledger,
            executor,
            gates,
            checkpointer,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &UnitLayout {
        &self.layout
    }

    /// Execute every phase of the unit.
    ///
    /// # Errors
    ///
    /// Setup problems only: a missing unit or ledger, an unparseable ledger,
    /// an invalid dependency graph, or a ledger that cannot be read or
    /// locked between phases. Task and gate failures end up in the report.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.layout.ensure_ready()?;

        let recovered = self.ledger.reset_running_async().await?;
        let tasks = self.ledger.load_async().await?;
        let phases = build_phases(&tasks)?;
        info!(
            "Unit {}: {} task(s) in {} phase(s)",
            self.layout.name(),
            tasks.len(),
            phases.len()
        );

        let start_head = self.checkpointer.head().unwrap_or_else(|e| {
            warn!("Could not read checkpoint head: {}", e);
            None
        });

        let mut report = RunReport {
            recovered,
            ..RunReport::default()
        };

        for phase in &phases {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if phase.is_complete() {
                info!("Phase {} already complete, skipping", phase.group);
                report.phases.push(PhaseReport::skipped(phase));
                continue;
            }

            for overlap in phase.file_overlaps() {
                warn!(
                    "Phase {}: {} is declared by tasks {}; they may conflict",
                    phase.group,
                    overlap.file,
                    overlap.task_ids.join(", ")
                );
            }

            let outcome = self.executor.run_phase(phase, cancel).await?;

            if outcome.was_cancelled() || cancel.is_cancelled() {
                info!("Run cancelled during phase {}", phase.group);
                report.phases.push(PhaseReport::from_outcome(outcome, None));
                report.cancelled = true;
                break;
            }

            let commit = if outcome.is_total_failure() {
                warn!(
                    "Phase {}: every task failed, skipping gates",
                    phase.group
                );
                None
            } else if outcome.succeeded() == 0 {
                info!("Phase {}: no task completed, skipping gates", phase.group);
                None
            } else {
                self.gates
                    .run(phase, &outcome.transcripts())
                    .await
                    .map(|record| record.hash)
            };

            report
                .phases
                .push(PhaseReport::from_outcome(outcome, commit));
        }

        if !report.cancelled && !report.commits().is_empty() && self.gates.enabled().align_docs {
            report.docs_commit = self
                .gates
                .align_docs_best_effort(start_head.as_deref())
                .await;
        }

        report.progress = self.ledger.progress_async().await?;
        info!("Unit {}: {}", self.layout.name(), report.progress);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::TaskOutcome;

    fn outcome(results: Vec<TaskOutcome>) -> PhaseOutcome {
        PhaseOutcome {
            group: 1,
            results: results
                .into_iter()
                .enumerate()
                .map(|(i, outcome)| TaskResult {
                    task_id: format!("T{i}"),
                    outcome,
                    attempts: 1,
                    transcript: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_phase_state_classification() {
        let failed = TaskOutcome::Failed { error: "x".into() };
        let blocked = TaskOutcome::Blocked {
            waiting_on: vec!["A".into()],
        };

        let cases = vec![
            (vec![TaskOutcome::Completed], PhaseState::Completed),
            (
                vec![TaskOutcome::Completed, failed.clone()],
                PhaseState::Partial,
            ),
            (
                vec![TaskOutcome::Completed, blocked.clone()],
                PhaseState::Partial,
            ),
            (vec![failed.clone(), failed], PhaseState::Failed),
            (vec![blocked], PhaseState::Blocked),
            (
                vec![TaskOutcome::Completed, TaskOutcome::Cancelled],
                PhaseState::Cancelled,
            ),
        ];

        for (results, expected) in cases {
            let report = PhaseReport::from_outcome(outcome(results), None);
            assert_eq!(report.state, expected);
        }
    }

    #[test]
    fn test_report_commits() {
        let mut report = RunReport::default();
        report
            .phases
            .push(PhaseReport::from_outcome(outcome(vec![TaskOutcome::Completed]), Some("abc".into())));
        report.phases.push(PhaseReport::from_outcome(
            outcome(vec![TaskOutcome::Failed { error: "x".into() }]),
            None,
        ));
        assert_eq!(report.commits(), vec!["abc"]);
        assert_eq!(report.failed_tasks(), 1);
    }
}
