//! Ledger text parsing.
//!
//! The grammar is line oriented:
//!
//! ```text
//! ledger   := preamble block*
//! block    := heading field*
//! heading  := "## " title
//! field    := "- **" key "**:" value continuation*
//! continuation := indented or blank line (description only)
//! ```
//!
//! Lists (`depends_on`, `files`) are read as strict JSON string arrays first.
//! The ledger is produced by a generative planner, so a malformed literal
//! goes through [`parse_list`]'s lenient branch instead of failing the run.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{Task, TaskStatus};
use crate::error::{Result, TasklineError};

/// How a list literal was understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListSyntax {
    /// Valid JSON array of strings.
    Json,
    /// Bracket stripping and comma splitting.
    Lenient,
}

/// One `- **key**: value` line, plus the heading it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawField {
    pub key: String,
    pub value: String,
    pub line: usize,
}

/// A heading with its fields, before typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawBlock {
    pub title: String,
    pub line: usize,
    pub fields: Vec<RawField>,
}

impl RawBlock {
    pub(crate) fn field(&self, key: &str) -> Option<&RawField> {
        self.fields.iter().find(|f| f.key == key)
    }
}

fn field_regex() -> &'static Regex {
    static FIELD_RE: OnceLock<Regex> = OnceLock::new();
    FIELD_RE.get_or_init(|| {
        Regex::new(r"^- \*\*([A-Za-z_][A-Za-z0-9_-]*)\*\*:[ \t]?(.*)$")
            .unwrap_or_else(|e| unreachable!("field pattern is valid: {e}"))
    })
}

/// Whether `line` opens a new block.
pub(crate) fn heading_title(line: &str) -> Option<&str> {
    line.strip_prefix("## ").map(str::trim)
}

/// Whether `line` is a field line; returns `(key, value)`.
pub(crate) fn field_line(line: &str) -> Option<(String, String)> {
    field_regex().captures(line).map(|caps| {
        (
            caps[1].to_ascii_lowercase(),
            caps[2].trim_end().to_string(),
        )
    })
}

/// Split text into raw blocks.
///
/// `multiline_key` names the one field allowed to continue over indented
/// lines; continuation lines lose up to two leading spaces.
pub(crate) fn split_blocks(text: &str, multiline_key: &str) -> Vec<RawBlock> {
    let mut blocks: Vec<RawBlock> = Vec::new();
    let mut in_multiline = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;

        if let Some(title) = heading_title(line) {
            blocks.push(RawBlock {
                title: title.to_string(),
                line: line_no,
                fields: Vec::new(),
            });
            in_multiline = false;
            continue;
        }

        let Some(block) = blocks.last_mut() else {
            continue;
        };

        if let Some((key, value)) = field_line(line) {
            in_multiline = key == multiline_key;
            block.fields.push(RawField {
                key,
                value,
                line: line_no,
            });
            continue;
        }

        if in_multiline {
            if let Some(field) = block.fields.last_mut() {
                let continuation = line.strip_prefix("  ").unwrap_or(line.trim_start());
                field.value.push('\n');
                field.value.push_str(continuation.trim_end());
            }
        } else if !line.trim().is_empty() {
            debug!("Ignoring stray ledger line {}: {}", line_no, line);
        }
    }

    for block in &mut blocks {
        for field in &mut block.fields {
            let trimmed = field.value.trim_end().len();
            field.value.truncate(trimmed);
        }
    }

    blocks
}

/// Parse a list literal, falling back to lenient comma splitting.
///
/// # Example
///
/// ```
/// use taskline::ledger::parser::{parse_list, ListSyntax};
///
/// assert_eq!(
///     parse_list(r#"["a", "b"]"#),
///     (vec!["a".to_string(), "b".to_string()], ListSyntax::Json)
/// );
/// assert_eq!(
///     parse_list("[a, 'b',]"),
///     (vec!["a".to_string(), "b".to_string()], ListSyntax::Lenient)
/// );
/// ```
#[must_use]
pub fn parse_list(value: &str) -> (Vec<String>, ListSyntax) {
    let value = value.trim();
    if value.is_empty() {
        return (Vec::new(), ListSyntax::Json);
    }

    if let Ok(items) = serde_json::from_str::<Vec<String>>(value) {
        let items = items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        return (items, ListSyntax::Json);
    }

    let inner = value.trim_start_matches('[').trim_end_matches(']');
    let items = inner
        .split(',')
        .map(|item| {
            item.trim()
                .trim_matches(|c| c == '"' || c == '\'' || c == '`')
                .trim()
                .to_string()
        })
        .filter(|item| !item.is_empty())
        .collect();
    (items, ListSyntax::Lenient)
}

fn parse_positive(field: &RawField, what: &str) -> Result<u32> {
    match field.value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(TasklineError::parse(
            field.line,
            format!("{what} must be a positive integer, got '{}'", field.value),
        )),
    }
}

fn parse_list_field(field: &RawField, task_id: &str) -> Vec<String> {
    let (items, syntax) = parse_list(&field.value);
    if syntax == ListSyntax::Lenient {
        debug!(
            "Task {} has non-JSON {} list at line {}, parsed leniently",
            task_id, field.key, field.line
        );
    }
    items
}

fn task_from_block(block: &RawBlock) -> Result<Task> {
    let id = block
        .field("id")
        .map(|f| f.value.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            TasklineError::parse(block.line, format!("task '{}' has no id", block.title))
        })?;

    let mut task = Task::new(id, block.title.clone());

    for field in &block.fields {
        match field.key.as_str() {
            "id" => {}
            "status" => {
                let value = field.value.trim();
                if !value.is_empty() {
                    task.status = TaskStatus::from_str(value).map_err(|_| {
                        TasklineError::parse(
                            field.line,
                            format!("task '{}' has invalid status '{}'", task.id, value),
                        )
                    })?;
                }
            }
            "parallel_group" => task.parallel_group = parse_positive(field, "parallel_group")?,
            "depends_on" => task.depends_on = parse_list_field(field, &task.id),
            "files" => task.files = parse_list_field(field, &task.id),
            "description" => task.description = field.value.trim().to_string(),
            "retry_count" => {
                task.retry_count = field.value.trim().parse().map_err(|_| {
                    TasklineError::parse(
                        field.line,
                        format!("retry_count must be a number, got '{}'", field.value),
                    )
                })?;
            }
            other => debug!("Ignoring unknown field '{}' on task {}", other, task.id),
        }
    }

    Ok(task)
}

/// Parse ledger text into tasks, preserving ledger order.
///
/// # Errors
///
/// Returns [`TasklineError::Parse`] when a block has no id, a status outside
/// the closed set, a bad number, or an id already used by an earlier block.
pub fn parse(text: &str) -> Result<Vec<Task>> {
    let blocks = split_blocks(text, "description");
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(blocks.len());

    for block in &blocks {
        let task = task_from_block(block)?;
        if !seen.insert(task.id.clone()) {
            return Err(TasklineError::parse(
                block.line,
                format!("duplicate task id '{}'", task.id),
            ));
        }
        tasks.push(task);
    }

    Ok(tasks)
}
