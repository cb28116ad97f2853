//! Run artifacts under `<workspace_root>/.autodev/runs/<run_id>/`.
//!
//! One directory per attempt plus a final `summary.json`. These are product
//! output, written regardless of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::changeset::ParseMethod;
use crate::core::decision::NextStage;
use crate::core::run_state::RunState;
use crate::core::types::{AppliedChange, RunStatus};
use crate::io::apply::WriteFailure;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub run_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub exit_code: i32,
    pub degraded: bool,
    /// `None` when no change set could be extracted.
    pub parse_method: Option<ParseMethod>,
    pub decision: NextStage,
    pub error_entry: Option<String>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub changes_path: PathBuf,
    pub transcript_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(run_dir: &Path, attempt: u32) -> Self {
        let dir = run_dir.join(format!("attempt-{attempt}"));
        Self {
            meta_path: dir.join("meta.json"),
            changes_path: dir.join("changes.json"),
            transcript_path: dir.join("transcript.log"),
            dir,
        }
    }
}

pub struct AttemptRecord<'a> {
    pub meta: &'a AttemptMeta,
    pub applied: &'a [AppliedChange],
    pub failures: &'a [WriteFailure],
    pub transcript: &'a str,
}

#[derive(Serialize)]
struct ChangesDoc<'a> {
    applied: &'a [AppliedChange],
    failures: &'a [WriteFailure],
}

#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: &'a str,
    repo_url: &'a str,
    branch: &'a str,
    base_branch: Option<&'a str>,
    status: RunStatus,
    attempt_count: u32,
    error_history: &'a [String],
    changes: &'a [AppliedChange],
    result_url: Option<&'a str>,
    fatal_error: Option<&'a str>,
    finished_at: String,
}

/// Writer for one run's artifact directory.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(workspace_root: &Path, run_id: &str) -> Self {
        Self {
            dir: workspace_root.join(".autodev").join("runs").join(run_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_attempt(&self, record: &AttemptRecord<'_>) -> Result<AttemptPaths> {
        let paths = AttemptPaths::new(&self.dir, record.meta.attempt);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

        write_json(&paths.meta_path, record.meta)?;
        write_json(
            &paths.changes_path,
            &ChangesDoc {
                applied: record.applied,
                failures: record.failures,
            },
        )?;
        write_text(&paths.transcript_path, record.transcript)?;
        Ok(paths)
    }

    pub fn write_summary(&self, state: &RunState) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create run dir {}", self.dir.display()))?;
        let path = self.dir.join("summary.json");
        write_json(
            &path,
            &RunSummary {
                run_id: &state.run_id,
                repo_url: &state.repo_url,
                branch: &state.branch,
                base_branch: state.base_branch.as_deref(),
                status: state.status(),
                attempt_count: state.attempt_count(),
                error_history: state.error_history(),
                changes: &state.changes,
                result_url: state.result_url.as_deref(),
                fatal_error: state.fatal_error.as_deref(),
                finished_at: timestamp(),
            },
        )?;
        Ok(path)
    }
}

/// RFC 3339 UTC timestamp with second precision.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
