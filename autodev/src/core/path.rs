//! Normalization of workspace-relative paths coming from generated payloads.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("absolute path not allowed: {0}")]
    Absolute(String),
    #[error("path escapes the workspace: {0}")]
    Escapes(String),
    #[error("path is inside repository metadata: {0}")]
    Reserved(String),
}

/// Directory name that generated changes may never touch.
pub const GIT_DIR: &str = ".git";

/// Normalize a generated path into a `/`-separated path relative to the
/// workspace root.
///
/// Backslashes are treated as separators and `.` segments are dropped.
/// Absolute paths, `..` segments and any `.git` segment are rejected.
pub fn normalize_relative(raw: &str) -> Result<String, PathError> {
    let cleaned = raw.trim().replace('\\', "/");
    if cleaned.is_empty() {
        return Err(PathError::Empty);
    }
    if cleaned.starts_with('/') || has_drive_prefix(&cleaned) {
        return Err(PathError::Absolute(raw.to_string()));
    }

    let mut parts = Vec::new();
    for component in Path::new(&cleaned).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if part.eq_ignore_ascii_case(GIT_DIR) {
                    return Err(PathError::Reserved(raw.to_string()));
                }
                parts.push(part.into_owned());
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(PathError::Escapes(raw.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(raw.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Resolve a normalized relative path against the workspace root.
pub fn resolve_in(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let normalized = normalize_relative(relative)?;
    Ok(root.join(normalized))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
