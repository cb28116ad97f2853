//! Job status surface: one writer (the running job), any number of pollers.
//!
//! Logs are append-only. The writer is not `Clone`, so only the job that
//! owns it can advance the status or append lines.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::core::types::RunStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusSnapshot {
    pub running: bool,
    pub status: RunStatus,
    pub logs: Vec<String>,
    pub result_url: Option<String>,
}

#[derive(Debug)]
struct Inner {
    running: bool,
    status: RunStatus,
    logs: Vec<String>,
    result_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct JobStatus;

impl JobStatus {
    /// Create a running job's status pair.
    pub fn start() -> (StatusWriter, StatusReader) {
        let shared = Arc::new(Mutex::new(Inner {
            running: true,
            status: RunStatus::Initialized,
            logs: Vec::new(),
            result_url: None,
        }));
        (
            StatusWriter {
                shared: Arc::clone(&shared),
            },
            StatusReader { shared },
        )
    }
}

fn lock(shared: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Write side, owned by the running job.
#[derive(Debug)]
pub struct StatusWriter {
    shared: Arc<Mutex<Inner>>,
}

impl StatusWriter {
    pub fn set_status(&self, status: RunStatus) {
        lock(&self.shared).status = status;
    }

    pub fn log(&self, line: impl Into<String>) {
        lock(&self.shared).logs.push(line.into());
    }

    /// Mark the job finished. Consumes the writer.
    pub fn finish(self, status: RunStatus, result_url: Option<String>) {
        let mut inner = lock(&self.shared);
        inner.status = status;
        inner.result_url = result_url;
        inner.running = false;
    }
}

impl Drop for StatusWriter {
    fn drop(&mut self) {
        lock(&self.shared).running = false;
    }
}

/// Read side, cheap to clone and safe to poll from any thread.
#[derive(Debug, Clone)]
pub struct StatusReader {
    shared: Arc<Mutex<Inner>>,
}

impl StatusReader {
    pub fn snapshot(&self) -> JobStatusSnapshot {
        let inner = lock(&self.shared);
        JobStatusSnapshot {
            running: inner.running,
            status: inner.status,
            logs: inner.logs.clone(),
            result_url: inner.result_url.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    /// Log lines from `offset` on, for tailing.
    pub fn logs_since(&self, offset: usize) -> Vec<String> {
        let inner = lock(&self.shared);
        inner.logs.iter().skip(offset).cloned().collect()
    }
}
