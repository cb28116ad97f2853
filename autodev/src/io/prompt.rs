//! Prompt rendering for the planning and change-generation requests.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::io::files::number_lines;

const PLAN_SYSTEM_TEMPLATE: &str = include_str!("prompts/plan_system.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const DEVELOP_SYSTEM_TEMPLATE: &str = include_str!("prompts/develop_system.md");
const DEVELOP_TEMPLATE: &str = include_str!("prompts/develop.md");

/// Tail of the previous transcript kept in a retry prompt.
pub const MAX_TRANSCRIPT_CHARS: usize = 4000;
/// Error history entries repeated in a retry prompt.
pub const RECENT_ERRORS: usize = 3;

/// Inputs for the planning request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanRequest {
    pub task: String,
    /// Tree lines, already capped.
    pub tree: Vec<String>,
    /// `(path, content)` of small project files.
    pub key_files: Vec<(String, String)>,
}

/// Inputs for one change-generation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeRequest {
    pub task: String,
    pub plan: Vec<String>,
    /// `(path, content)` of the files the generator may rewrite.
    pub files: Vec<(String, String)>,
    /// 1-based attempt about to run.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Transcript of the failed validation this attempt retries.
    pub previous_transcript: Option<String>,
    pub error_history: Vec<String>,
}

/// A system prompt plus user message pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Serialize)]
struct FileContext<'a> {
    path: &'a str,
    content: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        env.add_template("develop", DEVELOP_TEMPLATE)
            .context("load develop template")?;
        Ok(Self { env })
    }

    pub fn render_plan(&self, request: &PlanRequest) -> Result<Prompt> {
        let key_files: Vec<FileContext<'_>> = request
            .key_files
            .iter()
            .map(|(path, content)| FileContext {
                path: path.as_str(),
                content: content.trim_end().to_string(),
            })
            .collect();
        let user = self
            .env
            .get_template("plan")?
            .render(context! {
                task => request.task.trim(),
                tree => &request.tree,
                key_files => key_files,
            })
            .context("render plan prompt")?;
        Ok(Prompt {
            system: PLAN_SYSTEM_TEMPLATE.trim().to_string(),
            user,
        })
    }

    pub fn render_changes(&self, request: &ChangeRequest) -> Result<Prompt> {
        let files: Vec<FileContext<'_>> = request
            .files
            .iter()
            .map(|(path, content)| FileContext {
                path: path.as_str(),
                content: number_lines(content),
            })
            .collect();
        let previous = request
            .previous_transcript
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| tail_chars(t, MAX_TRANSCRIPT_CHARS));
        let skip = request.error_history.len().saturating_sub(RECENT_ERRORS);
        let user = self
            .env
            .get_template("develop")?
            .render(context! {
                task => request.task.trim(),
                plan => &request.plan,
                files => files,
                attempt => request.attempt,
                max_attempts => request.max_attempts,
                previous_transcript => previous,
                recent_errors => &request.error_history[skip..],
            })
            .context("render change prompt")?;
        Ok(Prompt {
            system: DEVELOP_SYSTEM_TEMPLATE.trim().to_string(),
            user,
        })
    }
}

/// Last `max` characters of `text`, marked when cut.
pub fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max).collect();
    format!("[... {} characters omitted]\n{tail}", count - max)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies the planning prompt carries the request, tree and key files in order.
    #[test]
    fn plan_prompt_sections_are_ordered() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_plan(&PlanRequest {
                task: "Add a /health endpoint".to_string(),
                tree: vec!["app.py".to_string(), "tests/test_app.py".to_string()],
                key_files: vec![("README.md".to_string(), "# Demo\n".to_string())],
            })
            .expect("render");
        let request = prompt.user.find("Add a /health endpoint").expect("task");
        let tree = prompt.user.find("  - tests/test_app.py").expect("tree");
        let readme = prompt.user.find("### README.md").expect("key file");
        assert!(request < tree && tree < readme);
        assert!(prompt.system.contains("relevant_files"));
    }

    #[test]
    fn plan_prompt_without_key_files_says_so() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_plan(&PlanRequest {
                task: "x".to_string(),
                ..PlanRequest::default()
            })
            .expect("render");
        assert!(prompt.user.contains("No README or project metadata files found."));
    }

    /// Verifies a first attempt has no failure context and files are line-numbered.
    #[test]
    fn first_attempt_prompt_has_no_failure_section() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_changes(&ChangeRequest {
                task: "Add greet()".to_string(),
                plan: vec!["Add function".to_string(), "Add test".to_string()],
                files: vec![("app.py".to_string(), "import os\nprint(1)\n".to_string())],
                attempt: 1,
                max_attempts: 3,
                previous_transcript: None,
                error_history: Vec::new(),
            })
            .expect("render");
        assert!(prompt.user.contains("1. Add function\n2. Add test"));
        assert!(prompt.user.contains("1: import os\n2: print(1)"));
        assert!(!prompt.user.contains("Previous Attempt Failed"));
        assert!(!prompt.user.contains("Error History"));
    }

    /// Verifies a retry carries the transcript and only the latest errors.
    #[test]
    fn retry_prompt_includes_failure_context() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_changes(&ChangeRequest {
                task: "Add greet()".to_string(),
                attempt: 3,
                max_attempts: 3,
                previous_transcript: Some("=== TESTS ===\nE   assert 1 == 2".to_string()),
                error_history: vec![
                    "first".to_string(),
                    "second".to_string(),
                    "third".to_string(),
                    "fourth".to_string(),
                ],
                ..ChangeRequest::default()
            })
            .expect("render");
        assert!(prompt.user.contains("Previous Attempt Failed (attempt 3 of 3)"));
        assert!(prompt.user.contains("E   assert 1 == 2"));
        assert!(!prompt.user.contains("- first"));
        assert!(prompt.user.contains("- second\n- third\n- fourth"));
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 10), "abcdef");
        assert_eq!(tail_chars("abcdef", 2), "[... 4 characters omitted]\nef");
    }
}
