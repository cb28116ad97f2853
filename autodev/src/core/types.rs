use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
///
/// Transitions form a DAG plus the single retry back-edge
/// `validating -> applying`; see [`crate::core::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Initialized,
    Planning,
    Applying,
    Validating,
    Publishing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialized => "initialized",
            RunStatus::Planning => "planning",
            RunStatus::Applying => "applying",
            RunStatus::Validating => "validating",
            RunStatus::Publishing => "publishing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a single file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    #[serde(alias = "add")]
    Create,
    #[default]
    #[serde(alias = "update", alias = "edit")]
    Modify,
    #[serde(alias = "remove")]
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change that was actually written to the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedChange {
    /// Path relative to the workspace root, `/`-separated.
    pub path: String,
    pub kind: ChangeKind,
    pub description: String,
    /// Zero for deletes.
    pub bytes_written: usize,
}

/// Timing and outcome of one validation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_secs: f64,
}

/// Outcome of the Validation Runner for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Human-readable transcript of every step.
    pub transcript: String,
    /// `0` means validated.
    pub exit_code: i32,
    /// True when the sandbox was unavailable and no command actually ran.
    pub degraded: bool,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// A failure that did not come from running any command (e.g. an
    /// unusable change payload).
    pub fn synthetic_failure(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            exit_code: 1,
            degraded: false,
            steps: Vec::new(),
        }
    }
}

/// One entry of the per-run validation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// 1-based attempt index.
    pub attempt: u32,
    pub exit_code: i32,
    pub degraded: bool,
    pub transcript: String,
}
