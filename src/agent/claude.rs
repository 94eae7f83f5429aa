//! [`AgentClient`] backed by the `claude` CLI.
//!
//! Each prompt spawns `claude -p` in the session's working directory. The
//! first prompt of a session passes `--session-id`, later ones `--resume`,
//! so the CLI keeps conversational context across retries of one attempt.
//! The transcript is kept in memory for [`AgentClient::get_messages`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{AgentClient, AgentResponse, Message, Session};

#[derive(Debug, Default)]
struct SessionState {
    started: bool,
    messages: Vec<Message>,
    abort: CancellationToken,
}

/// Drives the `claude` command-line agent.
#[derive(Debug)]
pub struct ClaudeCliAgent {
    binary: PathBuf,
    default_model: Option<String>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl Default for ClaudeCliAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeCliAgent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            default_model: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Use a specific executable instead of `claude` from `PATH`.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Model used when a prompt does not name one.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Whether the executable can be found.
    #[must_use]
    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    fn with_session<T>(
        &self,
        session: &Session,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Result<T> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("session table poisoned"))?;
        let state = sessions
            .get_mut(&session.id)
            .ok_or_else(|| anyhow!("unknown session {}", session.id))?;
        Ok(f(state))
    }

    fn build_args(&self, session_id: &str, resume: bool, model: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ];
        if let Some(model) = model.or(self.default_model.as_deref()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.push(if resume { "--resume" } else { "--session-id" }.to_string());
        args.push(session_id.to_string());
        args
    }
}

#[async_trait]
impl AgentClient for ClaudeCliAgent {
    async fn create_session(&self, title: &str, _dir: &Path) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
        };
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session table poisoned"))?
            .insert(session.id.clone(), SessionState::default());
        debug!("Created session {} ({})", session.id, title);
        Ok(session)
    }

    async fn send_prompt(
        &self,
        session: &Session,
        text: &str,
        model: Option<&str>,
        dir: &Path,
    ) -> Result<AgentResponse> {
        let (resume, abort) = self.with_session(session, |state| {
            let resume = state.started;
            state.started = true;
            state.messages.push(Message::user(text));
            (resume, state.abort.clone())
        })?;

        let args = self.build_args(&session.id, resume, model);
        debug!(
            "Running {} for session {} ({} chars prompt)",
            self.binary.display(),
            session.id,
            text.len()
        );

        let mut child = AsyncCommand::new(&self.binary)
            .args(&args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            () = abort.cancelled() => bail!("session {} aborted", session.id),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "claude exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let reply = String::from_utf8_lossy(&output.stdout).to_string();
        self.with_session(session, |state| {
            state.messages.push(Message::assistant(reply.clone()));
        })?;

        Ok(AgentResponse { text: reply })
    }

    async fn get_messages(&self, session: &Session, _dir: &Path) -> Result<Vec<Message>> {
        self.with_session(session, |state| state.messages.clone())
    }

    async fn delete_session(&self, session: &Session, _dir: &Path) -> Result<()> {
        let removed = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("session table poisoned"))?
            .remove(&session.id);
        if let Some(state) = removed {
            state.abort.cancel();
        }
        Ok(())
    }

    async fn abort_session(&self, session: &Session, _dir: &Path) -> Result<()> {
        let token = self.with_session(session, |state| {
            let token = state.abort.clone();
            // Fresh token so the session can accept a later prompt.
            state.abort = CancellationToken::new();
            token
        })?;
        token.cancel();
        debug!("Aborted session {}", session.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_prompt_uses_session_id() {
        let agent = ClaudeCliAgent::new();
        let args = agent.build_args("abc", false, None);
        assert_eq!(args[0], "-p");
        assert!(args.windows(2).any(|w| w[0] == "--session-id" && w[1] == "abc"));
        assert!(!args.contains(&"--model".to_string()));
    }

    #[test]
    fn test_follow_up_resumes_with_model() {
        let agent = ClaudeCliAgent::new().with_default_model("opus");
        let args = agent.build_args("abc", true, Some("sonnet"));
        assert!(args.windows(2).any(|w| w[0] == "--resume" && w[1] == "abc"));
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "sonnet"));

        let args = agent.build_args("abc", true, None);
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "opus"));
    }

    #[tokio::test]
    async fn test_session_lifecycle_without_prompts() {
        let agent = ClaudeCliAgent::new();
        let dir = std::env::temp_dir();
        let session = agent.create_session("T1", &dir).await.unwrap();
        assert!(Uuid::parse_str(&session.id).is_ok());
        assert!(agent.get_messages(&session, &dir).await.unwrap().is_empty());

        agent.abort_session(&session, &dir).await.unwrap();
        agent.delete_session(&session, &dir).await.unwrap();
        assert!(agent.get_messages(&session, &dir).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let agent = ClaudeCliAgent::new().with_binary("/nonexistent/claude-binary");
        assert!(!agent.is_available());
        let dir = std::env::temp_dir();
        let session = agent.create_session("T1", &dir).await.unwrap();
        let err = agent.send_prompt(&session, "hi", None, &dir).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
