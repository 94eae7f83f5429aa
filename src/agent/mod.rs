//! Session-based coding agent abstraction.
//!
//! The engine only needs a narrow, possibly slow and possibly failing
//! interface to whatever performs the work: open a session, send it a
//! prompt, read back the transcript, and close or abort it. The
//! [`AgentClient`] trait captures exactly that, so the execution engine can
//! run against the `claude` CLI in production and a mock in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskline::agent::{one_shot, AgentClient, ClaudeCliAgent};
//!
//! let agent: Arc<dyn AgentClient> = Arc::new(ClaudeCliAgent::new());
//! let reply = one_shot(agent.as_ref(), "review", "Review the diff", None, dir).await?;
//! ```

pub mod claude;

pub use claude::ClaudeCliAgent;

use std::fmt;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Handle to an open agent session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
}

/// Speaker of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// One entry of a session transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Reply to a single prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
}

/// Abstraction over the agent that performs task work.
///
/// Implementations must be `Send + Sync`; the executor shares one client
/// across every concurrent attempt of a phase through an `Arc<dyn AgentClient>`.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Open a session titled `title` working in `dir`.
    async fn create_session(&self, title: &str, dir: &Path) -> Result<Session>;

    /// Send `text` and wait for the reply.
    ///
    /// `model` selects a model for this prompt; `None` uses the agent's default.
    async fn send_prompt(
        &self,
        session: &Session,
        text: &str,
        model: Option<&str>,
        dir: &Path,
    ) -> Result<AgentResponse>;

    /// Full transcript of the session so far.
    async fn get_messages(&self, session: &Session, dir: &Path) -> Result<Vec<Message>>;

    /// Close the session and drop its state.
    async fn delete_session(&self, session: &Session, dir: &Path) -> Result<()>;

    /// Interrupt whatever the session is currently doing.
    async fn abort_session(&self, session: &Session, dir: &Path) -> Result<()>;
}

/// Run a single prompt in a throwaway session and return the reply text.
///
/// The session is deleted whether or not the prompt succeeds; a failed
/// delete is only logged.
pub async fn one_shot(
    agent: &dyn AgentClient,
    title: &str,
    prompt: &str,
    model: Option<&str>,
    dir: &Path,
) -> Result<String> {
    let session = agent.create_session(title, dir).await?;
    let reply = agent.send_prompt(&session, prompt, model, dir).await;

    if let Err(e) = agent.delete_session(&session, dir).await {
        debug!("Failed to delete session {}: {}", session.id, e);
    }

    Ok(reply?.text)
}

/// Render a transcript as markdown for the history directory.
#[must_use]
pub fn render_transcript(title: &str, messages: &[Message]) -> String {
    let mut out = format!("# {title}\n");
    for message in messages {
        out.push_str(&format!("\n## {}\n\n{}\n", message.role, message.text.trim_end()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAgent;

    #[tokio::test]
    async fn test_one_shot_returns_reply_and_deletes_session() {
        let agent = MockAgent::new().with_response("review", "looks good");
        let dir = std::env::temp_dir();

        let reply = one_shot(&agent, "review", "review the diff", None, &dir)
            .await
            .unwrap();

        assert_eq!(reply, "looks good");
        assert_eq!(agent.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_one_shot_deletes_session_on_failure() {
        let agent = MockAgent::new().with_failures("review", 1, "agent offline");
        let dir = std::env::temp_dir();

        let err = one_shot(&agent, "review", "review the diff", None, &dir)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("agent offline"));
        assert_eq!(agent.open_sessions(), 0);
    }

    #[test]
    fn test_render_transcript() {
        let text = render_transcript(
            "T1: schema",
            &[Message::user("do it"), Message::assistant("done\n")],
        );
        assert!(text.starts_with("# T1: schema\n"));
        assert!(text.contains("## user\n\ndo it\n"));
        assert!(text.ends_with("## assistant\n\ndone\n"));
    }
}
