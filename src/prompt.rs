//! Prompt text for task attempts, briefings and post-phase gates.

use crate::ledger::Task;
use crate::phase::Phase;

/// Diffs and transcripts longer than this are cut before prompting.
pub const MAX_EMBED_CHARS: usize = 60_000;

/// Summary of an earlier phase, fed to later tasks as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSummary {
    pub group: u32,
    pub text: String,
}

/// Inputs for a task's work instruction.
#[derive(Debug, Clone, Default)]
pub struct InstructionContext<'a> {
    /// Tasks this one depends on
    pub dependencies: Vec<&'a Task>,
    /// Summaries of earlier phases, oldest first
    pub summaries: &'a [PhaseSummary],
}

/// Cut `text` to at most `max` bytes on a char boundary, marking the cut.
#[must_use]
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n[... truncated {} bytes]", &text[..end], text.len() - end)
}

/// The work instruction for `task`, built from its own ledger fields.
#[must_use]
pub fn task_instruction(task: &Task, ctx: &InstructionContext<'_>) -> String {
    let mut lines = vec![
        format!("# Task {}: {}", task.id, task.title),
        String::new(),
        task.description.trim().to_string(),
    ];

    if !task.files.is_empty() {
        lines.push(String::new());
        lines.push("## Files".to_string());
        for file in &task.files {
            lines.push(format!("- `{file}`"));
        }
    }

    if !ctx.dependencies.is_empty() {
        lines.push(String::new());
        lines.push("## Already completed".to_string());
        for dep in &ctx.dependencies {
            lines.push(format!("- {}: {}", dep.id, dep.title));
        }
    }

    if !ctx.summaries.is_empty() {
        lines.push(String::new());
        lines.push("## Earlier phases".to_string());
        for summary in ctx.summaries {
            lines.push(format!("### Phase {}", summary.group));
            lines.push(summary.text.trim().to_string());
        }
    }

    lines.push(String::new());
    lines.push(
        "Work only on this task. Leave the repository building and its tests passing.".to_string(),
    );
    lines.join("\n")
}

/// Section appended to a retry so the agent sees why the last attempt failed.
#[must_use]
pub fn previous_error_section(error: &str) -> String {
    format!(
        "## Previous attempt failed\n\nThe last attempt at this task ended with this error:\n\n```\n{}\n```\n\nFix the cause before continuing.",
        truncate(error.trim(), MAX_EMBED_CHARS)
    )
}

/// Final prompt for one attempt.
#[must_use]
pub fn attempt_prompt(instruction: &str, previous_error: Option<&str>) -> String {
    match previous_error {
        Some(error) => format!("{}\n\n{}", instruction.trim_end(), previous_error_section(error)),
        None => instruction.to_string(),
    }
}

/// Ask the agent to distill project context into a task-specific instruction.
#[must_use]
pub fn briefing_request(instruction: &str, project_context: &str) -> String {
    format!(
        "You are preparing a briefing for an engineer who will implement one task.\n\
         Using the project context below, rewrite the task as a self-contained \
         instruction: keep every requirement, add the conventions, names and \
         constraints from the context that matter for it, and drop the rest.\n\
         Reply with the instruction only.\n\n\
         # Project context\n\n{}\n\n# Task\n\n{}",
        truncate(project_context.trim(), MAX_EMBED_CHARS),
        instruction.trim()
    )
}

fn phase_header(phase: &Phase) -> String {
    let mut lines = vec![format!("Phase {} covered these tasks:", phase.group)];
    for task in &phase.tasks {
        lines.push(format!("- {}: {}", task.id, task.title));
    }
    lines.join("\n")
}

/// Review every uncommitted change of the phase and fix what is wrong.
#[must_use]
pub fn review_prompt(phase: &Phase, diff: &str) -> String {
    format!(
        "{}\n\nReview the uncommitted changes below for bugs, missing error handling \
         and inconsistencies between tasks. Fix any problem directly in the files.\n\n\
         ```diff\n{}\n```",
        phase_header(phase),
        truncate(diff, MAX_EMBED_CHARS)
    )
}

/// Check assumptions about external APIs and libraries made during the phase.
#[must_use]
pub fn validate_prompt(phase: &Phase) -> String {
    format!(
        "{}\n\nCheck every assumption this work makes about external libraries, \
         APIs and tools (names, signatures, versions, behavior). Correct any code \
         that relies on something that does not exist or behaves differently.",
        phase_header(phase)
    )
}

/// Harden the phase's code for its domain's edge cases.
#[must_use]
pub fn harden_prompt(phase: &Phase) -> String {
    format!(
        "{}\n\nHarden the code written in this phase: handle edge cases, invalid \
         input and failure paths the domain calls for, and add tests for them. \
         Do not change behavior that is already correct.",
        phase_header(phase)
    )
}

/// Summarize the committed phase for later phases.
#[must_use]
pub fn summary_prompt(phase: &Phase, diff: &str) -> String {
    format!(
        "{}\n\nWrite a short summary of what this phase built, for engineers working \
         on later phases: modules and public types added, decisions made, and \
         anything left unfinished. Reply with the summary only.\n\n```diff\n{}\n```",
        phase_header(phase),
        truncate(diff, MAX_EMBED_CHARS)
    )
}

/// Extract open questions from the phase's transcripts as a JSON array.
#[must_use]
pub fn harvest_prompt(phase: &Phase, transcripts: &str) -> String {
    format!(
        "{}\n\nRead the transcripts below and list every open question or \
         uncertain assumption that a human should confirm. Reply with a JSON array \
         only, each element shaped like \
         {{\"question\": \"...\", \"context\": \"...\", \"task\": \"<task id>\"}}. \
         Reply with [] when there are none.\n\n{}",
        phase_header(phase),
        truncate(transcripts, MAX_EMBED_CHARS)
    )
}

/// Bring documentation in line with everything changed during the run.
#[must_use]
pub fn align_docs_prompt(diff: &str) -> String {
    format!(
        "The changes below were made during this run. Update README files, doc \
         comments and other documentation so they describe the code as it now is. \
         Change documentation only.\n\n```diff\n{}\n```",
        truncate(diff, MAX_EMBED_CHARS)
    )
}
