//! Controllable test doubles for the agent and checkpoint seams.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::agent::{AgentClient, AgentResponse, Message, Session};
use crate::error::{Result as TasklineResult, TasklineError};
use crate::vcs::Checkpointer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered record of side effects shared between mocks.
///
/// # Example
///
/// ```
/// use taskline::testing::EventLog;
///
/// let log = EventLog::new();
/// log.record("send:A");
/// log.record("commit:phase 1");
/// assert!(log.position("send:A") < log.position("commit:"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        lock(&self.events).push(event.into());
    }

    #[must_use]
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    /// Index of the first event starting with `prefix`.
    #[must_use]
    pub fn position(&self, prefix: &str) -> Option<usize> {
        lock(&self.events).iter().position(|e| e.starts_with(prefix))
    }
}

#[derive(Debug)]
struct FailureRule {
    marker: String,
    remaining: u32,
    error: String,
}

#[derive(Debug)]
struct MockSession {
    title: String,
    messages: Vec<Message>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock [`AgentClient`].
///
/// Prompts are matched by substring ("marker"): scripted failures and
/// responses apply to any prompt containing their marker. An optional gate
/// semaphore holds every prompt until the test adds permits, which lets
/// tests observe how many prompts are in flight at once.
#[derive(Debug, Default)]
pub struct MockAgent {
    default_response: String,
    responses: Vec<(String, String)>,
    failures: Mutex<Vec<FailureRule>>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    events: Option<EventLog>,
    prompts: Mutex<Vec<String>>,
    sessions: Mutex<HashMap<String, MockSession>>,
    aborted: Mutex<Vec<String>>,
    next_session: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockAgent {
    /// Mock that answers every prompt with `"ok"`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            default_response: "ok".to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_default_response(mut self, response: &str) -> Self {
        self.default_response = response.to_string();
        self
    }

    /// Answer prompts containing `marker` with `response`.
    #[must_use]
    pub fn with_response(mut self, marker: &str, response: &str) -> Self {
        self.responses
            .push((marker.to_string(), response.to_string()));
        self
    }

    /// Fail the first `count` prompts containing `marker`.
    #[must_use]
    pub fn with_failures(self, marker: &str, count: u32, error: &str) -> Self {
        lock(&self.failures).push(FailureRule {
            marker: marker.to_string(),
            remaining: count,
            error: error.to_string(),
        });
        self
    }

    /// Take `delay` to answer each prompt.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold every prompt until a permit of `gate` is available.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Every prompt received, in order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    /// Prompts containing `marker`.
    #[must_use]
    pub fn prompts_containing(&self, marker: &str) -> Vec<String> {
        lock(&self.prompts)
            .iter()
            .filter(|p| p.contains(marker))
            .cloned()
            .collect()
    }

    /// Sessions created and not yet deleted.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Titles of aborted sessions.
    #[must_use]
    pub fn aborted(&self) -> Vec<String> {
        lock(&self.aborted).clone()
    }

    /// Prompts currently being answered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of prompts answered at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, event: String) {
        if let Some(events) = &self.events {
            events.record(event);
        }
    }

    fn scripted_failure(&self, prompt: &str) -> Option<String> {
        let mut failures = lock(&self.failures);
        let rule = failures
            .iter_mut()
            .find(|r| r.remaining > 0 && prompt.contains(&r.marker))?;
        rule.remaining -= 1;
        Some(rule.error.clone())
    }

    fn response_for(&self, prompt: &str) -> String {
        self.responses
            .iter()
            .find(|(marker, _)| prompt.contains(marker))
            .map_or_else(|| self.default_response.clone(), |(_, r)| r.clone())
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    async fn create_session(&self, title: &str, _dir: &Path) -> Result<Session> {
        let id = format!("mock-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        lock(&self.sessions).insert(
            id.clone(),
            MockSession {
                title: title.to_string(),
                messages: Vec::new(),
            },
        );
        Ok(Session {
            id,
            title: title.to_string(),
        })
    }

    async fn send_prompt(
        &self,
        session: &Session,
        text: &str,
        _model: Option<&str>,
        _dir: &Path,
    ) -> Result<AgentResponse> {
        lock(&self.prompts).push(text.to_string());
        self.record(format!("send:{}", session.title));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| anyhow!("mock gate closed"))?
                .forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.scripted_failure(text) {
            self.record(format!("fail:{}", session.title));
            bail!("{error}");
        }

        let reply = self.response_for(text);
        let mut sessions = lock(&self.sessions);
        let state = sessions
            .get_mut(&session.id)
            .ok_or_else(|| anyhow!("unknown session {}", session.id))?;
        state.messages.push(Message::user(text));
        state.messages.push(Message::assistant(reply.clone()));
        Ok(AgentResponse { text: reply })
    }

    async fn get_messages(&self, session: &Session, _dir: &Path) -> Result<Vec<Message>> {
        lock(&self.sessions)
            .get(&session.id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| anyhow!("unknown session {}", session.id))
    }

    async fn delete_session(&self, session: &Session, _dir: &Path) -> Result<()> {
        lock(&self.sessions).remove(&session.id);
        Ok(())
    }

    async fn abort_session(&self, session: &Session, _dir: &Path) -> Result<()> {
        let title = lock(&self.sessions)
            .get(&session.id)
            .map_or_else(|| session.title.clone(), |s| s.title.clone());
        self.record(format!("abort:{title}"));
        lock(&self.aborted).push(title);
        Ok(())
    }
}

/// Mock [`Checkpointer`] that records commit messages.
#[derive(Debug)]
pub struct MockCheckpointer {
    changes: AtomicBool,
    fail_commits: bool,
    diff: String,
    commits: Mutex<Vec<String>>,
    events: Option<EventLog>,
}

impl Default for MockCheckpointer {
    fn default() -> Self {
        Self {
            changes: AtomicBool::new(true),
            fail_commits: false,
            diff: "+ changed".to_string(),
            commits: Mutex::new(Vec::new()),
            events: None,
        }
    }
}

impl MockCheckpointer {
    /// Mock whose working tree always has changes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the working tree reports changes.
    #[must_use]
    pub fn with_changes(self, changes: bool) -> Self {
        self.changes.store(changes, Ordering::SeqCst);
        self
    }

    /// Make every commit fail.
    #[must_use]
    pub fn with_failing_commits(mut self) -> Self {
        self.fail_commits = true;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Commit messages, in order.
    #[must_use]
    pub fn commits(&self) -> Vec<String> {
        lock(&self.commits).clone()
    }

    pub fn set_changes(&self, changes: bool) {
        self.changes.store(changes, Ordering::SeqCst);
    }
}

impl Checkpointer for MockCheckpointer {
    fn head(&self) -> TasklineResult<Option<String>> {
        let count = lock(&self.commits).len();
        Ok((count > 0).then(|| format!("commit-{count}")))
    }

    fn has_changes(&self) -> TasklineResult<bool> {
        Ok(self.changes.load(Ordering::SeqCst))
    }

    fn commit_all(&self, message: &str) -> TasklineResult<String> {
        if self.fail_commits {
            return Err(TasklineError::git("commit", "mock commit failure"));
        }
        let mut commits = lock(&self.commits);
        commits.push(message.to_string());
        if let Some(events) = &self.events {
            events.record(format!("commit:{message}"));
        }
        Ok(format!("commit-{}", commits.len()))
    }

    fn diff_uncommitted(&self) -> TasklineResult<String> {
        Ok(self.diff.clone())
    }

    fn diff_since(&self, base: &str) -> TasklineResult<String> {
        Ok(format!("diff since {base}\n{}", self.diff))
    }
}
