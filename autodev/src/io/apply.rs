//! Change Applicator: turn a raw generator payload into file writes.
//!
//! Parsing goes through [`parse_change_set`]; each resulting change is then
//! written independently, so one bad path never blocks the others.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::changeset::{
    ChangeSet, FileChange, ParseMethod, UngenerateableChangeSet, parse_change_set,
};
use crate::core::path::normalize_relative;
use crate::core::types::{AppliedChange, ChangeKind};
use crate::io::files::contained_path;

pub const BACKUP_SUFFIX: &str = "backup";

/// Result of a single file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub bytes_written: usize,
    pub backup_path: Option<PathBuf>,
    pub created: bool,
}

/// A change that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub change_set: ChangeSet,
    pub method: ParseMethod,
    pub applied: Vec<AppliedChange>,
    pub failures: Vec<WriteFailure>,
    /// Written text keyed by normalized path (deletes excluded).
    pub contents: BTreeMap<String, String>,
}

/// Write `content` to `path`, creating parent directories. When `backup` is
/// set and the file exists, its previous content is copied to `<path>.backup`.
pub fn write_file(path: &Path, content: &str, backup: bool) -> Result<WriteOutcome> {
    let existed = path.is_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let backup_path = if backup && existed {
        let target = backup_path_for(path);
        fs::copy(path, &target)
            .with_context(|| format!("back up {} to {}", path.display(), target.display()))?;
        Some(target)
    } else {
        None
    };
    fs::write(path, content).with_context(|| format!("write {}", path.display()))?;
    Ok(WriteOutcome {
        path: path.to_path_buf(),
        bytes_written: content.len(),
        backup_path,
        created: !existed,
    })
}

/// Delete a file. Returns `false` if it did not exist.
pub fn delete_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("delete {}", path.display())),
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Parse a raw payload and apply it under `workdir`.
///
/// Returns [`UngenerateableChangeSet`] only when no change could be
/// extracted; per-file problems are reported in [`ApplyReport::failures`].
#[instrument(skip_all, fields(workdir = %workdir.display(), payload_bytes = raw.len()))]
pub fn apply_payload(
    workdir: &Path,
    raw: &str,
    backup: bool,
) -> Result<ApplyReport, UngenerateableChangeSet> {
    let parsed = parse_change_set(raw)?;
    if parsed.method != ParseMethod::Strict {
        info!(method = ?parsed.method, "change set recovered from malformed payload");
    }
    let (applied, failures, contents) = apply_change_set(workdir, &parsed.change_set, backup);
    Ok(ApplyReport {
        change_set: parsed.change_set,
        method: parsed.method,
        applied,
        failures,
        contents,
    })
}

/// Apply every change of a parsed change set, independently.
pub fn apply_change_set(
    workdir: &Path,
    change_set: &ChangeSet,
    backup: bool,
) -> (Vec<AppliedChange>, Vec<WriteFailure>, BTreeMap<String, String>) {
    let mut applied = Vec::new();
    let mut failures = Vec::new();
    let mut contents = BTreeMap::new();

    for change in change_set.all_changes() {
        match apply_one(workdir, &change, backup) {
            Ok(Some((done, written))) => {
                debug!(path = %done.path, kind = %done.kind, bytes = done.bytes_written, "change applied");
                if let Some(text) = written {
                    contents.insert(done.path.clone(), text);
                }
                applied.push(done);
            }
            Ok(None) => failures.push(WriteFailure {
                path: change.file_path.clone(),
                error: "nothing to delete".to_string(),
            }),
            Err(err) => {
                warn!(path = %change.file_path, err = %err, "change not applied");
                failures.push(WriteFailure {
                    path: change.file_path.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
    }
    (applied, failures, contents)
}

type Applied = (AppliedChange, Option<String>);

fn apply_one(workdir: &Path, change: &FileChange, backup: bool) -> Result<Option<Applied>> {
    let relative = normalize_relative(&change.file_path)?;
    let target = contained_path(workdir, &relative)?;
    let description = change
        .description
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    if change.action == ChangeKind::Delete {
        if !delete_file(&target)? {
            return Ok(None);
        }
        return Ok(Some((
            AppliedChange {
                path: relative,
                kind: ChangeKind::Delete,
                description,
                bytes_written: 0,
            },
            None,
        )));
    }

    let content = change
        .content
        .as_deref()
        .with_context(|| format!("missing content for {relative}"))?;
    let outcome = write_file(&target, content, backup)?;
    let kind = if outcome.created {
        ChangeKind::Create
    } else {
        ChangeKind::Modify
    };
    Ok(Some((
        AppliedChange {
            path: relative,
            kind,
            description,
            bytes_written: outcome.bytes_written,
        },
        Some(content.to_string()),
    )))
}
