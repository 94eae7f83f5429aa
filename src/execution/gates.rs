//! Post-phase gates.
//!
//! After a phase that was not a total failure the driver runs, in order:
//! review, validate, harden, commit, summarize (only if something was
//! committed) and question harvest. Every gate is best-effort: an error is
//! logged at `warn` and the run moves on.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agent::{one_shot, AgentClient};
use crate::config::{ExecConfig, GateConfig};
use crate::error::{Result, TasklineError};
use crate::history::{collect_transcripts, SummaryStore};
use crate::ledger::parser::{parse_list, ListSyntax};
use crate::ledger::questions::{NewQuestion, QuestionLedger};
use crate::phase::Phase;
use crate::prompt;
use crate::unit::UnitLayout;
use crate::vcs::Checkpointer;

/// Post-phase gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKind {
    Review,
    Validate,
    Harden,
    Commit,
    Summarize,
    HarvestQuestions,
    AlignDocs,
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateKind::Review => "review",
            GateKind::Validate => "validate",
            GateKind::Harden => "harden",
            GateKind::Commit => "commit",
            GateKind::Summarize => "summarize",
            GateKind::HarvestQuestions => "harvest-questions",
            GateKind::AlignDocs => "align-docs",
        };
        f.write_str(name)
    }
}

/// A checkpoint made by the commit gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub hash: String,
    /// Changes the commit captured
    pub diff: String,
}

/// Runs the gates of a unit.
pub struct PhaseGates {
    agent: Arc<dyn AgentClient>,
    checkpointer: Arc<dyn Checkpointer>,
    project_dir: PathBuf,
    model: Option<String>,
    enabled: GateConfig,
    summaries: SummaryStore,
    questions: QuestionLedger,
}

impl PhaseGates {
    #[must_use]
    pub fn new(
        layout: &UnitLayout,
        agent: Arc<dyn AgentClient>,
        checkpointer: Arc<dyn Checkpointer>,
        config: &ExecConfig,
    ) -> Self {
        Self {
            agent,
            checkpointer,
            project_dir: layout.project_dir().to_path_buf(),
            model: config.model.clone(),
            enabled: config.gates,
            summaries: SummaryStore::new(layout.summaries_dir()),
            questions: QuestionLedger::open(layout.questions_path())
                .with_lock_timeout(config.lock_timeout()),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> &GateConfig {
        &self.enabled
    }

    /// Run every enabled gate for a finished phase; returns the checkpoint, if any.
    ///
    /// `transcripts` are the files saved by this run's attempts in the phase.
    pub async fn run(&self, phase: &Phase, transcripts: &[PathBuf]) -> Option<CommitRecord> {
        if self.enabled.review {
            self.best_effort(GateKind::Review, phase.group, self.review(phase))
                .await;
        }
        if self.enabled.validate {
            self.best_effort(GateKind::Validate, phase.group, self.validate(phase))
                .await;
        }
        if self.enabled.harden {
            self.best_effort(GateKind::Harden, phase.group, self.harden(phase))
                .await;
        }

        let commit = self
            .best_effort(GateKind::Commit, phase.group, async { self.commit(phase) })
            .await
            .flatten();

        if let Some(record) = &commit {
            if self.enabled.summarize {
                self.best_effort(
                    GateKind::Summarize,
                    phase.group,
                    self.summarize(phase, record),
                )
                .await;
            }
        }

        if self.enabled.harvest_questions {
            self.best_effort(
                GateKind::HarvestQuestions,
                phase.group,
                self.harvest_questions(phase, transcripts),
            )
            .await;
        }

        commit
    }

    async fn best_effort<T>(
        &self,
        gate: GateKind,
        group: u32,
        fut: impl Future<Output = Result<T>>,
    ) -> Option<T> {
        debug!("Running {} gate for phase {}", gate, group);
        match fut.await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Gate {} failed for phase {}: {}", gate, group, e);
                None
            }
        }
    }

    async fn ask(&self, gate: GateKind, title: &str, prompt: &str) -> Result<String> {
        one_shot(
            self.agent.as_ref(),
            title,
            prompt,
            self.model.as_deref(),
            &self.project_dir,
        )
        .await
        .map_err(|e| TasklineError::gate(gate.to_string(), e.to_string()))
    }

    /// Review uncommitted changes; the agent may edit files.
    pub async fn review(&self, phase: &Phase) -> Result<()> {
        let diff = self.checkpointer.diff_uncommitted()?;
        if diff.trim().is_empty() {
            debug!("Nothing to review for phase {}", phase.group);
            return Ok(());
        }
        self.ask(
            GateKind::Review,
            &format!("phase {} review", phase.group),
            &prompt::review_prompt(phase, &diff),
        )
        .await?;
        Ok(())
    }

    /// Check assumptions about external libraries and APIs.
    pub async fn validate(&self, phase: &Phase) -> Result<()> {
        self.ask(
            GateKind::Validate,
            &format!("phase {} validate", phase.group),
            &prompt::validate_prompt(phase),
        )
        .await?;
        Ok(())
    }

    pub async fn harden(&self, phase: &Phase) -> Result<()> {
        self.ask(
            GateKind::Harden,
            &format!("phase {} harden", phase.group),
            &prompt::harden_prompt(phase),
        )
        .await?;
        Ok(())
    }

    /// Commit the working tree; `None` when there is nothing to commit.
    pub fn commit(&self, phase: &Phase) -> Result<Option<CommitRecord>> {
        if !self.checkpointer.has_changes()? {
            info!("Phase {}: nothing to commit", phase.group);
            return Ok(None);
        }
        let diff = self.checkpointer.diff_uncommitted()?;
        let hash = self.checkpointer.commit_all(&commit_message(phase))?;
        info!("Phase {}: committed {}", phase.group, hash);
        Ok(Some(CommitRecord { hash, diff }))
    }

    /// Write `summaries/phase-<group>.md` from the committed diff.
    pub async fn summarize(&self, phase: &Phase, commit: &CommitRecord) -> Result<PathBuf> {
        let summary = self
            .ask(
                GateKind::Summarize,
                &format!("phase {} summary", phase.group),
                &prompt::summary_prompt(phase, &commit.diff),
            )
            .await?;
        if summary.trim().is_empty() {
            return Err(TasklineError::gate(
                GateKind::Summarize.to_string(),
                "agent returned an empty summary",
            ));
        }
        let path = self.summaries.save(phase.group, &summary)?;
        info!("Phase {}: summary written to {}", phase.group, path.display());
        Ok(path)
    }

    /// Append open questions found in the given transcripts of the phase.
    pub async fn harvest_questions(
        &self,
        phase: &Phase,
        transcripts: &[PathBuf],
    ) -> Result<Vec<String>> {
        let transcripts = collect_transcripts(transcripts)?;
        if transcripts.trim().is_empty() {
            return Ok(Vec::new());
        }

        let reply = self
            .ask(
                GateKind::HarvestQuestions,
                &format!("phase {} questions", phase.group),
                &prompt::harvest_prompt(phase, &transcripts),
            )
            .await?;
        let questions = parse_harvest_reply(&reply);
        let ledger = self.questions.clone();
        let group = phase.group;
        let assigned = tokio::task::spawn_blocking(move || ledger.append(group, &questions))
            .await
            .map_err(|e| {
                TasklineError::gate(GateKind::HarvestQuestions.to_string(), e.to_string())
            })??;
        if !assigned.is_empty() {
            info!(
                "Phase {}: recorded {} open question(s)",
                phase.group,
                assigned.len()
            );
        }
        Ok(assigned)
    }

    /// Align documentation with everything changed since `base`.
    ///
    /// Documentation edits are committed as their own checkpoint.
    pub async fn align_docs(&self, base: Option<&str>) -> Result<Option<String>> {
        let diff = match base {
            Some(base) => self.checkpointer.diff_since(base)?,
            None => String::new(),
        };
        self.ask(GateKind::AlignDocs, "align docs", &prompt::align_docs_prompt(&diff))
            .await?;

        if !self.checkpointer.has_changes()? {
            return Ok(None);
        }
        let hash = self.checkpointer.commit_all("docs: align with implementation")?;
        info!("Documentation aligned in {}", hash);
        Ok(Some(hash))
    }

    /// [`align_docs`](Self::align_docs) with errors logged instead of returned.
    pub async fn align_docs_best_effort(&self, base: Option<&str>) -> Option<String> {
        match self.align_docs(base).await {
            Ok(commit) => commit,
            Err(e) => {
                warn!("Gate {} failed: {}", GateKind::AlignDocs, e);
                None
            }
        }
    }
}

/// `phase <group>: <title>; <title>; ...`
#[must_use]
pub fn commit_message(phase: &Phase) -> String {
    format!("phase {}: {}", phase.group, phase.titles().join("; "))
}

/// Questions from a harvest reply; anything malformed yields none.
///
/// The array may be wrapped in prose or a code fence.
#[must_use]
pub fn parse_harvest_reply(reply: &str) -> Vec<NewQuestion> {
    let (Some(start), Some(end)) = (reply.find('['), reply.rfind(']')) else {
        return Vec::new();
    };
    if end < start {
        return Vec::new();
    }
    let json = &reply[start..=end];

    match serde_json::from_str::<Vec<NewQuestion>>(json) {
        Ok(questions) => questions,
        Err(e) => {
            // A bare list of strings is still usable.
            match parse_list(json) {
                (items, ListSyntax::Json) => items
                    .into_iter()
                    .map(|question| NewQuestion {
                        question,
                        context: String::new(),
                        task: None,
                    })
                    .collect(),
                _ => {
                    debug!("Unparseable harvest reply: {}", e);
                    Vec::new()
                }
            }
        }
    }
}
