//! Commit message and pull request text for a finished run.

use crate::core::run_state::RunState;
use crate::core::types::AppliedChange;

pub const TITLE_PREFIX: &str = "[autodev] ";
pub const MAX_TITLE_CHARS: usize = 72;
pub const MAX_SUBJECT_CHARS: usize = 50;
pub const MAX_COMMIT_CHANGES: usize = 10;
const MAX_CHANGE_NOTE_CHARS: usize = 50;

const REQUEST_PREFIXES: [&str; 10] = [
    "please ",
    "can you ",
    "could you ",
    "i want to ",
    "i need to ",
    "implement ",
    "add ",
    "create ",
    "fix ",
    "update ",
];

/// Task text with one leading request phrase removed and the first letter
/// capitalized.
pub fn summarize_task(task: &str) -> String {
    let trimmed = task.trim();
    let lower = trimmed.to_lowercase();
    let mut rest = trimmed;
    for prefix in REQUEST_PREFIXES {
        if lower.starts_with(prefix) && trimmed.is_char_boundary(prefix.len()) {
            rest = &trimmed[prefix.len()..];
            break;
        }
    }
    let mut chars = rest.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Pull request title, at most [`MAX_TITLE_CHARS`] characters.
pub fn pr_title(task: &str) -> String {
    truncate_chars(&format!("{TITLE_PREFIX}{}", summarize_task(task)), MAX_TITLE_CHARS)
}

/// Subject line plus a bullet per change (at most [`MAX_COMMIT_CHANGES`]).
pub fn commit_message(task: &str, changes: &[AppliedChange]) -> String {
    let subject = summarize_task(task);
    let subject = if subject.is_empty() {
        "Automated changes".to_string()
    } else {
        truncate_chars(&subject, MAX_SUBJECT_CHARS)
    };

    let mut message = subject;
    if changes.is_empty() {
        return message;
    }
    message.push_str("\n\nChanges:\n");
    for change in changes.iter().take(MAX_COMMIT_CHANGES) {
        let kind = change.kind.as_str().to_uppercase();
        if change.description.trim().is_empty() {
            message.push_str(&format!("  - [{kind}] {}\n", change.path));
        } else {
            let note = truncate_chars(change.description.trim(), MAX_CHANGE_NOTE_CHARS);
            message.push_str(&format!("  - [{kind}] {}: {note}\n", change.path));
        }
    }
    if changes.len() > MAX_COMMIT_CHANGES {
        message.push_str(&format!(
            "  ... and {} more changes\n",
            changes.len() - MAX_COMMIT_CHANGES
        ));
    }
    message.trim_end().to_string()
}

/// Markdown body: original request, plan, changes, attempts used.
pub fn pr_body(state: &RunState) -> String {
    let mut body = String::new();
    body.push_str("## Automated change\n\n");
    body.push_str("### Request\n");
    body.push_str(state.task.trim());
    body.push_str("\n\n### Plan\n");
    if state.plan.is_empty() {
        body.push_str("_no plan recorded_\n");
    }
    for (index, step) in state.plan.iter().enumerate() {
        body.push_str(&format!("{}. {}\n", index + 1, step));
    }
    body.push_str("\n### Changes\n");
    if state.changes.is_empty() {
        body.push_str("_no file changes_\n");
    }
    for change in &state.changes {
        let description = if change.description.trim().is_empty() {
            "no description"
        } else {
            change.description.trim()
        };
        body.push_str(&format!(
            "- `{}` **{}**: {}\n",
            change.kind, change.path, description
        ));
    }
    body.push_str("\n### Validation\n");
    body.push_str(&format!("- Attempts: {}\n", state.attempt_count() + 1));
    match state.validations.last() {
        Some(record) if record.degraded => {
            body.push_str("- Status: validation skipped (sandbox unavailable)\n");
        }
        Some(_) => body.push_str("- Status: all checks passed\n"),
        None => body.push_str("- Status: not validated\n"),
    }
    body
}

/// Truncate to `max` characters, ending in `...` when shortened.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
