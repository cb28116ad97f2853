//! Repository scanning and file reading for planning context.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::path::{normalize_relative, resolve_in};
use crate::io::config::ScanConfig;

/// Directory names never descended into.
pub const IGNORED_DIRS: [&str; 11] = [
    ".git",
    "__pycache__",
    "node_modules",
    ".venv",
    "venv",
    ".env",
    ".idea",
    ".vscode",
    "dist",
    "build",
    ".eggs",
];

/// Files read whole as planning context when small enough.
pub const KEY_FILES: [&str; 4] = ["README.md", "setup.py", "pyproject.toml", "package.json"];
pub const MAX_KEY_FILE_BYTES: u64 = 3000;
pub const MAX_KEY_FILES: usize = 3;

/// List files under `root` matching the configured extensions, as sorted
/// `/`-separated relative paths. Hidden entries and [`IGNORED_DIRS`] are skipped.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn list_files(root: &Path, config: &ScanConfig) -> Result<Vec<String>> {
    let mut files = Vec::new();
    // files directly in root are depth 1
    let walker = WalkDir::new(root)
        .max_depth(config.max_depth.saturating_add(1))
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped(entry));

    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !config.extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        files.push(parts.join("/"));
    }
    files.sort();
    debug!(count = files.len(), "scanned files");
    Ok(files)
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return true;
    }
    entry.file_type().is_dir() && IGNORED_DIRS.contains(&name.as_ref())
}

/// Resolve a generated path under `root` for reading or writing.
///
/// The path is normalized first. Every component that already exists must
/// be a real file or directory: a symlink anywhere along the way could
/// point outside the workspace, so it is refused.
pub fn contained_path(root: &Path, raw: &str) -> Result<PathBuf> {
    let relative = normalize_relative(raw)?;
    let mut current = root.to_path_buf();
    for part in relative.split('/') {
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(anyhow!("path goes through a symlink: {relative}"));
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) => {
                return Err(err).with_context(|| format!("inspect {}", current.display()));
            }
        }
    }
    Ok(resolve_in(root, &relative)?)
}

/// Read a text file; invalid UTF-8 is replaced rather than rejected.
pub fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

/// Prefix each line with its 1-based number (`"12: code"`).
pub fn number_lines(content: &str) -> String {
    content
        .lines()
        .enumerate()
        .map(|(index, line)| format!("{}: {line}", index + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Up to [`MAX_KEY_FILES`] small key files present in `file_map`.
pub fn read_key_files(root: &Path, file_map: &[String]) -> Vec<(String, String)> {
    let mut found = Vec::new();
    for name in KEY_FILES {
        if found.len() == MAX_KEY_FILES {
            break;
        }
        if !file_map.iter().any(|path| path == name) {
            continue;
        }
        let Ok(path) = contained_path(root, name) else {
            continue;
        };
        let small = fs::metadata(&path)
            .map(|meta| meta.len() < MAX_KEY_FILE_BYTES)
            .unwrap_or(false);
        if !small {
            continue;
        }
        if let Ok(text) = read_text(&path) {
            found.push((name.to_string(), text));
        }
    }
    found
}

/// File tree listing capped at `max_entries`, with an overflow note.
pub fn render_tree(file_map: &[String], max_entries: usize) -> Vec<String> {
    let mut lines: Vec<String> = file_map.iter().take(max_entries).cloned().collect();
    if file_map.len() > max_entries {
        lines.push(format!("... and {} more files", file_map.len() - max_entries));
    }
    lines
}
