//! Open-questions ledger.
//!
//! Uncertainties surfaced by the agent during a phase are appended here by
//! the question-harvest gate. The document uses the same block grammar as
//! the task ledger, keyed by question id:
//!
//! ```text
//! ## Should sessions expire after inactivity?
//! - **id**: Q3
//! - **status**: unanswered
//! - **task**: T7
//! - **phase**: 2
//! - **context**: The description does not say how long tokens live.
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::parser::split_blocks;
use super::write_atomic;
use super::writer::push_multiline_field;
use crate::error::{Result, TasklineError};
use crate::lock::FileLock;

/// Title line written at the top of the questions ledger.
pub const QUESTIONS_HEADER: &str = "# Open Questions";

/// Answer state of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuestionStatus {
    #[default]
    Unanswered,
    /// Answered by the agent from context, pending human confirmation
    AutoAnswered,
    Answered,
}

impl QuestionStatus {
    /// Ledger spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionStatus::Unanswered => "unanswered",
            QuestionStatus::AutoAnswered => "auto-answered",
            QuestionStatus::Answered => "answered",
        }
    }
}

impl fmt::Display for QuestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionStatus {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unanswered" => Ok(QuestionStatus::Unanswered),
            "auto-answered" => Ok(QuestionStatus::AutoAnswered),
            "answered" => Ok(QuestionStatus::Answered),
            other => Err(TasklineError::InvalidStatus {
                value: other.to_string(),
            }),
        }
    }
}

/// One open question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub question: String,
    pub status: QuestionStatus,
    /// Task whose transcript raised the question
    pub task: Option<String>,
    pub phase: Option<u32>,
    pub context: String,
    pub answer: Option<String>,
}

/// A question harvested from transcripts, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQuestion {
    pub question: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub task: Option<String>,
}

/// Parse the questions ledger.
pub fn parse_questions(text: &str) -> Result<Vec<Question>> {
    let mut questions = Vec::new();

    for block in split_blocks(text, "context") {
        let id = block
            .field("id")
            .map(|f| f.value.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                TasklineError::parse(block.line, format!("question '{}' has no id", block.title))
            })?;

        let mut question = Question {
            id,
            question: block.title.clone(),
            status: QuestionStatus::Unanswered,
            task: None,
            phase: None,
            context: String::new(),
            answer: None,
        };

        for field in &block.fields {
            let value = field.value.trim();
            match field.key.as_str() {
                "status" if !value.is_empty() => {
                    question.status = value.parse().map_err(|_| {
                        TasklineError::parse(
                            field.line,
                            format!("question '{}' has invalid status '{}'", question.id, value),
                        )
                    })?;
                }
                "task" if !value.is_empty() => question.task = Some(value.to_string()),
                "phase" if !value.is_empty() => {
                    question.phase = Some(value.parse().map_err(|_| {
                        TasklineError::parse(field.line, format!("phase must be a number, got '{value}'"))
                    })?);
                }
                "context" => question.context = value.to_string(),
                "answer" if !value.is_empty() => question.answer = Some(value.to_string()),
                _ => {}
            }
        }

        questions.push(question);
    }

    Ok(questions)
}

/// Serialize the questions ledger.
#[must_use]
pub fn write_questions(questions: &[Question]) -> String {
    let mut out = String::new();
    out.push_str(QUESTIONS_HEADER);
    out.push('\n');

    for q in questions {
        out.push('\n');
        out.push_str(&format!("## {}\n", q.question.replace('\n', " ")));
        out.push_str(&format!("- **id**: {}\n", q.id));
        out.push_str(&format!("- **status**: {}\n", q.status));
        if let Some(task) = &q.task {
            out.push_str(&format!("- **task**: {task}\n"));
        }
        if let Some(phase) = q.phase {
            out.push_str(&format!("- **phase**: {phase}\n"));
        }
        if let Some(answer) = &q.answer {
            out.push_str(&format!("- **answer**: {}\n", answer.replace('\n', " ")));
        }
        push_multiline_field(&mut out, "context", &q.context);
    }

    out
}

fn question_number(id: &str) -> Option<u32> {
    id.strip_prefix('Q').and_then(|n| n.parse().ok())
}

/// File-backed questions ledger.
#[derive(Debug, Clone)]
pub struct QuestionLedger {
    path: PathBuf,
    lock: FileLock,
}

impl QuestionLedger {
    /// Open the questions ledger at `path`; the file is created on first append.
    #[must_use]
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock = FileLock::new(&path);
        Self { path, lock }
    }

    /// Set the lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock = self.lock.with_timeout(timeout);
        self
    }

    /// Path of the document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all questions; a missing file is an empty ledger.
    pub fn load(&self) -> Result<Vec<Question>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => parse_questions(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Questions still waiting for a human answer.
    pub fn unanswered(&self) -> Result<Vec<Question>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|q| q.status != QuestionStatus::Answered)
            .collect())
    }

    /// Append questions raised in `phase`, returning their assigned ids.
    ///
    /// Ids continue from the highest existing `Q<n>`. Questions whose text
    /// already appears in the ledger are skipped.
    pub fn append(&self, phase: u32, new_questions: &[NewQuestion]) -> Result<Vec<String>> {
        if new_questions.is_empty() {
            return Ok(Vec::new());
        }

        self.lock.with_lock(|| {
            let mut questions = self.load()?;
            let mut next = questions
                .iter()
                .filter_map(|q| question_number(&q.id))
                .max()
                .unwrap_or(0)
                + 1;

            let mut assigned = Vec::new();
            for new in new_questions {
                let text = new.question.trim();
                if text.is_empty()
                    || questions
                        .iter()
                        .any(|q| q.question.eq_ignore_ascii_case(text))
                {
                    debug!("Skipping duplicate or empty question: {}", text);
                    continue;
                }

                let id = format!("Q{next}");
                next += 1;
                questions.push(Question {
                    id: id.clone(),
                    question: text.to_string(),
                    status: QuestionStatus::Unanswered,
                    task: new.task.clone(),
                    phase: Some(phase),
                    context: new.context.trim().to_string(),
                    answer: None,
                });
                assigned.push(id);
            }

            if !assigned.is_empty() {
                write_atomic(&self.path, &write_questions(&questions))?;
            }
            Ok(assigned)
        })
    }

    /// Record an answer for question `id`.
    pub fn answer(&self, id: &str, answer: &str, auto: bool) -> Result<()> {
        self.lock.with_lock(|| {
            let mut questions = self.load()?;
            let question = questions
                .iter_mut()
                .find(|q| q.id == id)
                .ok_or_else(|| TasklineError::QuestionNotFound { id: id.to_string() })?;
            question.answer = Some(answer.trim().to_string());
            question.status = if auto {
                QuestionStatus::AutoAnswered
            } else {
                QuestionStatus::Answered
            };
            write_atomic(&self.path, &write_questions(&questions))
        })
    }
}
