//! Single task attempt.
//!
//! [`TaskRunner::run_task`] is the unit the retry loop drives: it owns the
//! `pending -> running -> completed | failed` transitions for one attempt
//! and talks to the agent. Sessions currently sending a prompt are kept in
//! an in-flight registry so the executor can abort them when an attempt
//! times out or the run is cancelled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::agent::{render_transcript, AgentClient, Message, Session};
use crate::config::ExecConfig;
use crate::error::{Result, TasklineError};
use crate::history::{HistoryStore, SummaryStore};
use crate::ledger::{runnable_tasks, Ledger, Task, TaskStatus};
use crate::prompt::{attempt_prompt, briefing_request, task_instruction, InstructionContext};
use crate::unit::UnitLayout;

/// A successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAttempt {
    pub task_id: String,
    pub reply: String,
    /// Saved transcript, `None` if saving it failed
    pub transcript: Option<PathBuf>,
}

/// Runs one attempt at one task against the agent.
pub struct TaskRunner {
    layout: UnitLayout,
    ledger: Ledger,
    agent: Arc<dyn AgentClient>,
    history: HistoryStore,
    summaries: SummaryStore,
    model: Option<String>,
    briefing: bool,
    inflight: Mutex<HashMap<String, Session>>,
}

impl TaskRunner {
    #[must_use]
    pub fn new(layout: UnitLayout, agent: Arc<dyn AgentClient>, config: &ExecConfig) -> Self {
        let ledger = Ledger::open(layout.tasks_path()).with_lock_timeout(config.lock_timeout());
        let history =
            HistoryStore::new(layout.history_dir()).with_lock_timeout(config.lock_timeout());
        let summaries = SummaryStore::new(layout.summaries_dir());
        Self {
            layout,
            ledger,
            agent,
            history,
            summaries,
            model: config.model.clone(),
            briefing: config.briefing,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[must_use]
    pub fn layout(&self) -> &UnitLayout {
        &self.layout
    }

    /// Run one attempt.
    ///
    /// With `task_id` unset the task is inferred: it must be the only
    /// runnable task. `previous_error` is the last attempt's failure, shown
    /// to the agent so it can correct course.
    ///
    /// # Errors
    ///
    /// - [`TasklineError::TaskNotFound`] for an unknown explicit id
    /// - [`TasklineError::NoRunnableTask`] / [`TasklineError::AmbiguousTask`]
    ///   when inference finds zero or several candidates
    /// - [`TasklineError::Attempt`] when the agent fails; the task is then `failed`
    /// - [`TasklineError::LockTimeout`] when a status write cannot get the
    ///   ledger lock; a failed completion write also leaves the task `failed`
    pub async fn run_task(
        &self,
        task_id: Option<&str>,
        previous_error: Option<&str>,
    ) -> Result<TaskAttempt> {
        let tasks = self.ledger.load_async().await?;
        let task = resolve_task(&tasks, task_id)?.clone();

        self.ledger
            .update_status_async(&task.id, TaskStatus::Running)
            .await?;
        info!("Starting task {}: {}", task.id, task.title);

        let outcome = match self.attempt(&task, &tasks, previous_error).await {
            Ok(attempt) => self
                .ledger
                .update_status_async(&task.id, TaskStatus::Completed)
                .await
                .map(|()| attempt),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(attempt) => {
                info!("Task {} completed", task.id);
                Ok(attempt)
            }
            Err(e) => {
                if let Err(mark_err) = self
                    .ledger
                    .update_status_async(&task.id, TaskStatus::Failed)
                    .await
                {
                    warn!("Could not mark task {} failed: {}", task.id, mark_err);
                }
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        task: &Task,
        tasks: &[Task],
        previous_error: Option<&str>,
    ) -> Result<TaskAttempt> {
        let dir = self.layout.project_dir();
        let instruction = self.build_instruction(task, tasks).await;
        let prompt = attempt_prompt(&instruction, previous_error);

        let session = self
            .agent
            .create_session(&format!("{}: {}", task.id, task.title), dir)
            .await
            .map_err(|e| TasklineError::attempt(&task.id, format!("create session: {e}")))?;

        // Registered until closed so a timeout or cancellation at any later
        // await can still abort and delete it.
        self.register_inflight(&task.id, &session);
        let response = match self
            .agent
            .send_prompt(&session, &prompt, self.model.as_deref(), dir)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.finish_session(&task.id, &session).await;
                return Err(TasklineError::attempt(&task.id, e.to_string()));
            }
        };

        let messages = match self.agent.get_messages(&session, dir).await {
            Ok(messages) => messages,
            Err(e) => {
                debug!("Transcript unavailable for {}: {}", task.id, e);
                vec![Message::user(prompt.clone()), Message::assistant(response.text.clone())]
            }
        };
        self.finish_session(&task.id, &session).await;

        let transcript = render_transcript(&session.title, &messages);
        let history = self.history.clone();
        let id = task.id.clone();
        let saved = tokio::task::spawn_blocking(move || history.save(&id, &transcript)).await;
        let transcript = match saved {
            Ok(Ok(path)) => Some(path),
            Ok(Err(e)) => {
                warn!("Could not save transcript for {}: {}", task.id, e);
                None
            }
            Err(e) => {
                warn!("Saving transcript for {} panicked: {}", task.id, e);
                None
            }
        };

        Ok(TaskAttempt {
            task_id: task.id.clone(),
            reply: response.text,
            transcript,
        })
    }

    /// Plain instruction, optionally distilled through a briefing prompt.
    async fn build_instruction(&self, task: &Task, tasks: &[Task]) -> String {
        let summaries = self
            .summaries
            .load_before(task.parallel_group)
            .unwrap_or_else(|e| {
                warn!("Could not load phase summaries: {}", e);
                Vec::new()
            });
        let ctx = InstructionContext {
            dependencies: tasks
                .iter()
                .filter(|t| task.depends_on.contains(&t.id))
                .collect(),
            summaries: &summaries,
        };
        let instruction = task_instruction(task, &ctx);

        if !self.briefing {
            return instruction;
        }
        let context = self.layout.read_context().unwrap_or_else(|e| {
            warn!("Could not read project context: {}", e);
            String::new()
        });
        if context.trim().is_empty() {
            return instruction;
        }

        let request = briefing_request(&instruction, &context);
        match self.briefing_reply(task, &request).await {
            Ok(briefing) if !briefing.trim().is_empty() => briefing,
            Ok(_) => {
                warn!("Empty briefing for {}, using plain instruction", task.id);
                instruction
            }
            Err(e) => {
                warn!("Briefing failed for {}, using plain instruction: {}", task.id, e);
                instruction
            }
        }
    }

    /// One-off briefing exchange, registered in flight like the attempt itself.
    async fn briefing_reply(&self, task: &Task, request: &str) -> Result<String> {
        let dir = self.layout.project_dir();
        let session = self
            .agent
            .create_session(&format!("{} briefing", task.id), dir)
            .await?;

        self.register_inflight(&task.id, &session);
        let reply = self
            .agent
            .send_prompt(&session, request, self.model.as_deref(), dir)
            .await;
        self.finish_session(&task.id, &session).await;

        Ok(reply?.text)
    }

    fn register_inflight(&self, task_id: &str, session: &Session) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.insert(task_id.to_string(), session.clone());
        }
    }

    fn take_inflight(&self, task_id: &str) -> Option<Session> {
        self.inflight
            .lock()
            .ok()
            .and_then(|mut inflight| inflight.remove(task_id))
    }

    /// Leave the registry and delete a session that ran to completion.
    async fn finish_session(&self, task_id: &str, session: &Session) {
        self.take_inflight(task_id);
        self.close_session(session).await;
    }

    async fn close_session(&self, session: &Session) {
        if let Err(e) = self
            .agent
            .delete_session(session, self.layout.project_dir())
            .await
        {
            debug!("Failed to delete session {}: {}", session.id, e);
        }
    }

    /// Abort the session of an attempt that was interrupted mid-prompt.
    ///
    /// Returns whether a session was in flight.
    pub async fn abort_inflight(&self, task_id: &str) -> bool {
        let Some(session) = self.take_inflight(task_id) else {
            return false;
        };
        if let Err(e) = self
            .agent
            .abort_session(&session, self.layout.project_dir())
            .await
        {
            warn!("Failed to abort session for {}: {}", task_id, e);
        }
        self.close_session(&session).await;
        info!("Aborted in-flight session for task {}", task_id);
        true
    }

    /// Put a task back to `pending` and count the retry.
    pub async fn reset_for_retry(&self, task_id: &str) -> Result<()> {
        self.ledger
            .update_status_async(task_id, TaskStatus::Pending)
            .await?;
        self.ledger.bump_retry_count_async(task_id).await?;
        Ok(())
    }
}

/// Pick the task an attempt is for.
pub fn resolve_task<'a>(tasks: &'a [Task], task_id: Option<&str>) -> Result<&'a Task> {
    if let Some(id) = task_id {
        return tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| TasklineError::TaskNotFound { id: id.to_string() });
    }

    let runnable = runnable_tasks(tasks);
    match runnable.as_slice() {
        [] => Err(TasklineError::NoRunnableTask),
        [only] => Ok(*only),
        many => Err(TasklineError::AmbiguousTask {
            candidates: many.iter().map(|t| t.id.clone()).collect(),
        }),
    }
}
