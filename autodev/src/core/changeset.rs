//! Change-set payloads and the layered recovery chain that turns raw
//! generator output into a usable [`ChangeSet`].
//!
//! Generated payloads are frequently malformed: wrapped in markdown fences,
//! surrounded by prose, carrying raw newlines or invalid escapes inside
//! strings, or truncated mid-object. Each [`Strategy`] either produces a
//! change set, passes the payload on with a reason, or stops the chain.

use std::sync::LazyLock;

use jsonschema::Draft;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::types::ChangeKind;

const CHANGE_SET_SCHEMA: &str = include_str!("../../schemas/change_set.schema.json");

/// Description given to changes recovered by pattern extraction.
pub const EXTRACTED_DESCRIPTION: &str = "auto-extracted change";

/// Description given to the optional test file.
pub const TEST_FILE_DESCRIPTION: &str = "test file for verification";

static SCHEMA: LazyLock<Result<jsonschema::Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(CHANGE_SET_SCHEMA).map_err(|e| e.to_string())?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| e.to_string())
});

static PATH_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)"(?:file_path|path)"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap()
});

static CONTENT_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)"content"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(alias = "path")]
    pub file_path: String,
    #[serde(default)]
    pub action: ChangeKind,
    /// Full new content. `None` is only valid for deletes.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFile {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub test_file: Option<TestFile>,
    #[serde(default)]
    pub explanation: Option<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.test_file.is_none()
    }

    /// Every change in application order, the test file last.
    pub fn all_changes(&self) -> Vec<FileChange> {
        let mut all = self.changes.clone();
        if let Some(test) = &self.test_file {
            all.push(FileChange {
                file_path: test.file_path.clone(),
                action: ChangeKind::Modify,
                content: Some(test.content.clone()),
                description: Some(TEST_FILE_DESCRIPTION.to_string()),
            });
        }
        all
    }
}

/// Which layer of the chain produced the change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMethod {
    Strict,
    Cleaned,
    PatternExtracted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChangeSet {
    pub change_set: ChangeSet,
    pub method: ParseMethod,
}

/// No layer of the chain could produce a single change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not extract any changes ({})", .reasons.join("; "))]
pub struct UngenerateableChangeSet {
    /// One reason per layer that was tried, in order.
    pub reasons: Vec<String>,
}

/// Result of one recovery layer.
#[derive(Debug)]
enum Step {
    Parsed(ChangeSet),
    Continue(String),
    Terminal(String),
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    Strict,
    Cleanup,
    PatternExtraction,
}

impl Strategy {
    const CHAIN: [Strategy; 3] = [
        Strategy::Strict,
        Strategy::Cleanup,
        Strategy::PatternExtraction,
    ];

    fn name(self) -> &'static str {
        match self {
            Strategy::Strict => "strict",
            Strategy::Cleanup => "cleanup",
            Strategy::PatternExtraction => "pattern extraction",
        }
    }

    fn method(self) -> ParseMethod {
        match self {
            Strategy::Strict => ParseMethod::Strict,
            Strategy::Cleanup => ParseMethod::Cleaned,
            Strategy::PatternExtraction => ParseMethod::PatternExtracted,
        }
    }

    fn attempt(self, raw: &str) -> Step {
        match self {
            Strategy::Strict => {
                if raw.trim().is_empty() {
                    return Step::Terminal("empty payload".to_string());
                }
                parse_value(raw.trim())
            }
            Strategy::Cleanup => parse_value(&clean_payload(raw)),
            Strategy::PatternExtraction => extract_pairs(raw),
        }
    }
}

/// Run the recovery chain over a raw generator payload.
pub fn parse_change_set(raw: &str) -> Result<ParsedChangeSet, UngenerateableChangeSet> {
    let mut reasons = Vec::new();
    for strategy in Strategy::CHAIN {
        match strategy.attempt(raw) {
            Step::Parsed(change_set) => {
                return Ok(ParsedChangeSet {
                    change_set,
                    method: strategy.method(),
                });
            }
            Step::Continue(reason) => reasons.push(format!("{}: {reason}", strategy.name())),
            Step::Terminal(reason) => {
                reasons.push(format!("{}: {reason}", strategy.name()));
                break;
            }
        }
    }
    Err(UngenerateableChangeSet { reasons })
}

fn parse_value(text: &str) -> Step {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return Step::Continue(format!("invalid json: {err}")),
    };
    if let Err(reason) = check_schema(&value) {
        return Step::Continue(reason);
    }
    match serde_json::from_value::<ChangeSet>(value) {
        Ok(change_set) if change_set.is_empty() => Step::Continue("payload has no changes".to_string()),
        Ok(change_set) => Step::Parsed(change_set),
        Err(err) => Step::Continue(format!("unexpected shape: {err}")),
    }
}

fn check_schema(value: &Value) -> Result<(), String> {
    let validator = SCHEMA
        .as_ref()
        .map_err(|err| format!("change set schema unusable: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(format!("schema violations: {}", messages.join(", ")))
    }
}

/// Strip fences and prose, drop control characters, and make string
/// literals legal JSON.
fn clean_payload(raw: &str) -> String {
    let unfenced = strip_code_fence(raw);
    let object = outermost_object(unfenced).unwrap_or(unfenced);
    let printable: String = object
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();
    escape_inside_strings(&printable)
}

pub(crate) fn strip_code_fence(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after_open = &raw[open + 3..];
    // skip the info string (e.g. `json`)
    let body = match after_open.find('\n') {
        Some(newline) => &after_open[newline + 1..],
        None => after_open,
    };
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

pub(crate) fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Escape raw newlines, carriage returns and tabs inside JSON string
/// literals, and double backslashes that do not start a valid escape.
fn escape_inside_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut pending_backslash = false;

    for c in text.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if pending_backslash {
            pending_backslash = false;
            if matches!(c, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') {
                out.push('\\');
                out.push(c);
                continue;
            }
            out.push_str("\\\\");
        }
        match c {
            '\\' => pending_backslash = true,
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    if pending_backslash {
        out.push_str("\\\\");
    }
    out
}

/// Pair each `file_path` with the first `content` that follows it before
/// the next path. Truncated trailing entries are dropped.
fn extract_pairs(raw: &str) -> Step {
    let paths: Vec<(usize, String)> = PATH_FIELD
        .captures_iter(raw)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let value = caps.get(1)?;
            Some((whole.start(), unescape_json_string(value.as_str())))
        })
        .collect();
    let contents: Vec<(usize, String)> = CONTENT_FIELD
        .captures_iter(raw)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let value = caps.get(1)?;
            Some((whole.start(), unescape_json_string(value.as_str())))
        })
        .collect();

    let mut changes = Vec::new();
    for (index, (start, path)) in paths.iter().enumerate() {
        let end = paths.get(index + 1).map_or(usize::MAX, |(next, _)| *next);
        let content = contents
            .iter()
            .find(|(position, _)| position > start && *position < end);
        let (Some((_, content)), false) = (content, path.trim().is_empty()) else {
            continue;
        };
        changes.push(FileChange {
            file_path: path.clone(),
            action: ChangeKind::Modify,
            content: Some(content.clone()),
            description: Some(EXTRACTED_DESCRIPTION.to_string()),
        });
    }

    if changes.is_empty() {
        return Step::Terminal("no path/content pairs found".to_string());
    }
    Step::Parsed(ChangeSet {
        changes,
        test_file: None,
        explanation: None,
    })
}

fn unescape_json_string(escaped: &str) -> String {
    let quoted = format!("\"{}\"", escape_inside_strings_body(escaped));
    if let Ok(value) = serde_json::from_str::<String>(&quoted) {
        return value;
    }
    unescape_lenient(escaped)
}

fn escape_inside_strings_body(body: &str) -> String {
    let wrapped = format!("\"{body}\"");
    let escaped = escape_inside_strings(&wrapped);
    escaped[1..escaped.len() - 1].to_string()
}

fn unescape_lenient(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
