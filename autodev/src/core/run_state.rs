//! The single record describing one end-to-end run.
//!
//! Status, attempt count and error history are only mutable from inside the
//! crate; the pipeline coordinator is the only caller of those setters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{AppliedChange, ChangeKind, RunStatus, ValidationRecord, ValidationReport};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workspace already set to {current}, refusing to move it to {requested}")]
pub struct WorkspaceAlreadySet {
    pub current: String,
    pub requested: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub repo_url: String,
    /// Feature branch the run commits to.
    pub branch: String,
    /// Branch the pull request targets. Resolved during planning.
    pub base_branch: Option<String>,
    /// Natural-language change request.
    pub task: String,
    workspace: Option<PathBuf>,

    /// Every scanned file path, relative to the workspace.
    pub file_map: Vec<String>,
    pub plan: Vec<String>,
    pub relevant_files: Vec<String>,
    /// Cache of file contents keyed by relative path; updated after writes.
    pub file_contents: BTreeMap<String, String>,
    /// Latest applied change per path, in first-touched order.
    pub changes: Vec<AppliedChange>,

    pub last_transcript: String,
    pub last_exit_code: Option<i32>,
    pub validations: Vec<ValidationRecord>,

    attempt_count: u32,
    error_history: Vec<String>,
    status: RunStatus,

    pub result_url: Option<String>,
    /// Infrastructure failure that ended the run without consuming attempts.
    pub fatal_error: Option<String>,
}

impl RunState {
    pub fn new(
        run_id: impl Into<String>,
        repo_url: impl Into<String>,
        branch: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            repo_url: repo_url.into(),
            branch: branch.into(),
            base_branch: None,
            task: task.into(),
            workspace: None,
            file_map: Vec::new(),
            plan: Vec::new(),
            relevant_files: Vec::new(),
            file_contents: BTreeMap::new(),
            changes: Vec::new(),
            last_transcript: String::new(),
            last_exit_code: None,
            validations: Vec::new(),
            attempt_count: 0,
            error_history: Vec::new(),
            status: RunStatus::Initialized,
            result_url: None,
            fatal_error: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn error_history(&self) -> &[String] {
        &self.error_history
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    /// Bind the run to its workspace. Set once; re-setting the same path is a no-op.
    pub fn set_workspace(&mut self, path: impl Into<PathBuf>) -> Result<(), WorkspaceAlreadySet> {
        let path = path.into();
        match &self.workspace {
            Some(current) if *current != path => Err(WorkspaceAlreadySet {
                current: current.display().to_string(),
                requested: path.display().to_string(),
            }),
            _ => {
                self.workspace = Some(path);
                Ok(())
            }
        }
    }

    /// Most recent error entry, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.error_history.last().map(String::as_str)
    }

    pub(crate) fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    /// Apply the attempt count and error entry produced by the decision router.
    pub(crate) fn record_decision(&mut self, attempt_count: u32, error_entry: Option<String>) {
        self.attempt_count = attempt_count;
        if let Some(entry) = error_entry {
            self.error_history.push(entry);
        }
    }

    pub(crate) fn record_validation(&mut self, attempt: u32, report: &ValidationReport) {
        self.last_transcript = report.transcript.clone();
        self.last_exit_code = Some(report.exit_code);
        self.validations.push(ValidationRecord {
            attempt,
            exit_code: report.exit_code,
            degraded: report.degraded,
            transcript: report.transcript.clone(),
        });
    }

    /// Fold applied changes in, keeping one entry per path and refreshing the
    /// content cache. `contents` supplies the written text for non-deletes.
    pub(crate) fn record_changes(
        &mut self,
        applied: &[AppliedChange],
        contents: &BTreeMap<String, String>,
    ) {
        for change in applied {
            match change.kind {
                ChangeKind::Delete => {
                    self.file_contents.remove(&change.path);
                }
                ChangeKind::Create | ChangeKind::Modify => {
                    if let Some(content) = contents.get(&change.path) {
                        self.file_contents
                            .insert(change.path.clone(), content.clone());
                    }
                }
            }
            match self.changes.iter_mut().find(|c| c.path == change.path) {
                Some(existing) => *existing = change.clone(),
                None => self.changes.push(change.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, kind: ChangeKind, bytes: usize) -> AppliedChange {
        AppliedChange {
            path: path.to_string(),
            kind,
            description: format!("{kind} {path}"),
            bytes_written: bytes,
        }
    }

    #[test]
    fn new_state_starts_initialized_with_no_attempts() {
        let state = RunState::new("run-1", "https://github.com/o/r", "feature", "add x");
        assert_eq!(state.status(), RunStatus::Initialized);
        assert_eq!(state.attempt_count(), 0);
        assert!(state.error_history().is_empty());
        assert!(state.workspace().is_none());
    }

    #[test]
    fn workspace_is_set_once() {
        let mut state = RunState::new("run-1", "url", "b", "t");
        state.set_workspace("/tmp/ws-a").expect("first set");
        state.set_workspace("/tmp/ws-a").expect("same path is idempotent");
        let err = state.set_workspace("/tmp/ws-b").expect_err("move");
        assert!(err.to_string().contains("/tmp/ws-b"));
        assert_eq!(state.workspace(), Some(Path::new("/tmp/ws-a")));
    }

    #[test]
    fn record_changes_keeps_latest_entry_per_path() {
        let mut state = RunState::new("run-1", "url", "b", "t");
        let mut contents = BTreeMap::new();
        contents.insert("a.py".to_string(), "v1".to_string());
        state.record_changes(&[change("a.py", ChangeKind::Create, 2)], &contents);

        contents.insert("a.py".to_string(), "v22".to_string());
        contents.insert("b.py".to_string(), "b".to_string());
        state.record_changes(
            &[
                change("a.py", ChangeKind::Modify, 3),
                change("b.py", ChangeKind::Create, 1),
            ],
            &contents,
        );

        assert_eq!(state.changes.len(), 2);
        assert_eq!(state.changes[0].kind, ChangeKind::Modify);
        assert_eq!(state.file_contents["a.py"], "v22");

        state.record_changes(&[change("b.py", ChangeKind::Delete, 0)], &BTreeMap::new());
        assert!(!state.file_contents.contains_key("b.py"));
        assert_eq!(state.changes[1].kind, ChangeKind::Delete);
    }

    #[test]
    fn record_decision_appends_entry() {
        let mut state = RunState::new("run-1", "url", "b", "t");
        state.record_decision(1, Some("boom".to_string()));
        state.record_decision(1, None);
        assert_eq!(state.attempt_count(), 1);
        assert_eq!(state.error_history(), ["boom".to_string()]);
        assert_eq!(state.last_error(), Some("boom"));
    }
}
