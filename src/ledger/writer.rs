//! Ledger serialization and in-place field patching.
//!
//! [`write`] renders a full ledger. [`patch_field`] rewrites a single field
//! line of one task block and leaves every other byte untouched, so hand
//! edits and planner formatting outside that line survive status updates.

use super::parser::{field_line, heading_title};
use super::Task;
use crate::error::{Result, TasklineError};

/// Title line written at the top of every ledger.
pub const LEDGER_HEADER: &str = "# Tasks";

/// Render a JSON string array.
pub(crate) fn format_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Render a multi-line value as a field, indenting continuation lines.
pub(crate) fn push_multiline_field(out: &mut String, key: &str, value: &str) {
    let mut lines = value.lines();
    out.push_str(&format!("- **{key}**: {}\n", lines.next().unwrap_or("")));
    for line in lines {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
}

/// Serialize tasks in order.
///
/// `parse(&write(tasks))` yields the same records.
#[must_use]
pub fn write(tasks: &[Task]) -> String {
    let mut out = String::new();
    out.push_str(LEDGER_HEADER);
    out.push('\n');

    for task in tasks {
        out.push('\n');
        out.push_str(&format!("## {}\n", task.title));
        out.push_str(&format!("- **id**: {}\n", task.id));
        out.push_str(&format!("- **status**: {}\n", task.status));
        out.push_str(&format!("- **parallel_group**: {}\n", task.parallel_group));
        out.push_str(&format!(
            "- **depends_on**: {}\n",
            format_list(&task.depends_on)
        ));
        out.push_str(&format!("- **files**: {}\n", format_list(&task.files)));
        out.push_str(&format!("- **retry_count**: {}\n", task.retry_count));
        push_multiline_field(&mut out, "description", &task.description);
    }

    out
}

/// What to do when the block has no line for the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MissingField {
    /// Fail with `MalformedTask`.
    Reject,
    /// Insert a new field line after the `id` line.
    Insert,
}

/// Replace the value of `key` in the block whose `id` is `id`.
///
/// Returns the patched text and the previous value.
pub(crate) fn patch_field(
    text: &str,
    id: &str,
    key: &str,
    value: &str,
    missing: MissingField,
) -> Result<(String, Option<String>)> {
    let lines: Vec<&str> = text.lines().collect();

    let mut block_start = None;
    let mut id_line = None;
    let mut target_line = None;

    let mut current_start = None;
    let mut current_id = None;
    let mut current_target = None;

    let mut finish = |start: Option<usize>, found_id: Option<usize>, target: Option<usize>| {
        if block_start.is_none() && found_id.is_some() {
            block_start = start;
            id_line = found_id;
            target_line = target;
        }
    };

    for (idx, line) in lines.iter().enumerate() {
        if heading_title(line).is_some() {
            finish(current_start, current_id, current_target);
            current_start = Some(idx);
            current_id = None;
            current_target = None;
            continue;
        }
        if current_start.is_none() {
            continue;
        }
        if let Some((field_key, field_value)) = field_line(line) {
            if field_key == "id" && field_value.trim() == id {
                current_id = Some(idx);
            } else if field_key == key && current_target.is_none() {
                current_target = Some(idx);
            }
        }
    }
    finish(current_start, current_id, current_target);

    let Some(id_idx) = id_line else {
        return Err(TasklineError::TaskNotFound { id: id.to_string() });
    };

    let new_line = format!("- **{key}**: {value}");
    let mut patched: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();

    let previous = match (target_line, missing) {
        (Some(idx), _) => {
            let previous = field_line(lines[idx]).map(|(_, v)| v.trim().to_string());
            patched[idx] = new_line;
            previous
        }
        (None, MissingField::Insert) => {
            patched.insert(id_idx + 1, new_line);
            None
        }
        (None, MissingField::Reject) => {
            return Err(TasklineError::MalformedTask {
                id: id.to_string(),
                reason: format!("no {key} field to update"),
            });
        }
    };

    let mut out = patched.join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    Ok((out, previous))
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::super::TaskStatus;
    use super::*;

    fn sample_tasks() -> Vec<Task> {
        let mut a = Task::new("A", "Set up crate");
        a.status = TaskStatus::Completed;
        a.files = vec!["Cargo.toml".into()];
        a.description = "Create the workspace.".into();

        let mut b = Task::new("B", "Add parser");
        b.parallel_group = 2;
        b.depends_on = vec!["A".into()];
        b.files = vec!["src/parser.rs".into(), "src/lib.rs".into()];
        b.retry_count = 3;
        b.description = "Parse the format.\n\n  Indented detail line.\nLast line.".into();

        let mut c = Task::new("C", "Title with \"quotes\", commas");
        c.status = TaskStatus::Skipped;
        c.parallel_group = 7;
        c.depends_on = vec!["A".into(), "B".into()];
        vec![a, b, c]
    }

    #[test]
    fn test_round_trip_preserves_records() {
        let tasks = sample_tasks();
        let text = write(&tasks);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed, tasks);
    }

    #[test]
    fn test_write_is_order_preserving() {
        let text = write(&sample_tasks());
        let a = text.find("- **id**: A").unwrap();
        let b = text.find("- **id**: B").unwrap();
        let c = text.find("- **id**: C").unwrap();
        assert!(a < b && b < c);
        assert!(text.starts_with(LEDGER_HEADER));
    }

    #[test]
    fn test_write_empty_ledger() {
        let text = write(&[]);
        assert!(parse(&text).unwrap().is_empty());
    }

    #[test]
    fn test_patch_status_only_touches_one_line() {
        let text = write(&sample_tasks());
        let (patched, previous) =
            patch_field(&text, "B", "status", "running", MissingField::Reject).unwrap();
        assert_eq!(previous.as_deref(), Some("pending"));

        let changed: Vec<_> = text
            .lines()
            .zip(patched.lines())
            .filter(|(a, b)| a != b)
            .collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].1, "- **status**: running");
        assert_eq!(text.lines().count(), patched.lines().count());
    }

    #[test]
    fn test_patch_unknown_id_is_not_found() {
        let text = write(&sample_tasks());
        let err = patch_field(&text, "Z", "status", "running", MissingField::Reject).unwrap_err();
        assert!(matches!(err, TasklineError::TaskNotFound { .. }));
    }

    #[test]
    fn test_patch_missing_status_is_malformed() {
        let text = "## A\n- **id**: A\n- **parallel_group**: 1\n";
        let err = patch_field(text, "A", "status", "running", MissingField::Reject).unwrap_err();
        assert!(matches!(err, TasklineError::MalformedTask { .. }));
    }

    #[test]
    fn test_patch_insert_missing_field() {
        let text = "## A\n- **id**: A\n- **status**: pending\n";
        let (patched, previous) =
            patch_field(text, "A", "retry_count", "1", MissingField::Insert).unwrap();
        assert!(previous.is_none());
        assert_eq!(
            patched,
            "## A\n- **id**: A\n- **retry_count**: 1\n- **status**: pending\n"
        );
    }

    #[test]
    fn test_patch_does_not_cross_block_boundary() {
        let text = "## A\n- **id**: A\n\n## B\n- **id**: B\n- **status**: pending\n";
        let err = patch_field(text, "A", "status", "running", MissingField::Reject).unwrap_err();
        assert!(matches!(err, TasklineError::MalformedTask { .. }));
    }

    #[test]
    fn test_patch_preserves_status_field_listed_before_id() {
        let text = "## A\n- **status**: pending\n- **id**: A\n";
        let (patched, _) =
            patch_field(text, "A", "status", "completed", MissingField::Reject).unwrap();
        assert_eq!(patched, "## A\n- **status**: completed\n- **id**: A\n");
    }
}
