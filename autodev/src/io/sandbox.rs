//! Sandbox Executor: run one shell command against a workspace directory in
//! an isolated, resource-limited, time-bounded environment.
//!
//! Two runtimes implement [`Sandbox`]: [`DockerSandbox`] (container per
//! command) and [`LocalSandbox`] (process group on the host). Both guarantee
//! the environment is gone when `execute` returns, on every path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::config::{SandboxConfig, SandboxRuntime};
use crate::io::process::{CommandOutput, exit_code_of};

pub use crate::io::docker::DockerSandbox;
pub use crate::io::local::LocalSandbox;

/// Exit code reported when the timeout fired.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Mount point of the workspace inside a container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

impl SandboxRequest {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, or [`TIMEOUT_EXIT_CODE`] on timeout.
    pub exit_code: i32,
    pub duration_secs: f64,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub(crate) fn from_output(output: &CommandOutput) -> Self {
        let exit_code = if output.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            exit_code_of(&output.status)
        };
        Self {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code,
            duration_secs: output.duration.as_secs_f64(),
            timed_out: output.timed_out,
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The runtime itself cannot be used (not installed, daemon down,
    /// credentials or image problems). Callers may degrade.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),
    /// The runtime was reachable but failed unexpectedly.
    #[error("sandbox runtime failure: {0:#}")]
    Runtime(#[from] anyhow::Error),
}

impl SandboxError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SandboxError::Unavailable(_))
    }
}

pub trait Sandbox {
    /// Run `request.command` via `sh -c` with `request.workdir` as the working directory.
    fn execute(&self, request: &SandboxRequest) -> Result<ExecutionResult, SandboxError>;

    /// Probe the runtime; returns a short version/description string.
    fn check_available(&self) -> Result<String, SandboxError>;
}

impl<S: Sandbox + ?Sized> Sandbox for Box<S> {
    fn execute(&self, request: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        (**self).execute(request)
    }

    fn check_available(&self) -> Result<String, SandboxError> {
        (**self).check_available()
    }
}

/// Build the runtime selected in configuration.
pub fn build_sandbox(config: &SandboxConfig) -> Box<dyn Sandbox + Send + Sync> {
    match config.runtime {
        SandboxRuntime::Docker => Box::new(DockerSandbox::from_config(config)),
        SandboxRuntime::Local => Box::new(LocalSandbox::from_config(config)),
    }
}

/// Reject requests no runtime can honor.
pub fn validate_request(request: &SandboxRequest) -> Result<(), SandboxError> {
    if request.command.trim().is_empty() {
        return Err(SandboxError::InvalidRequest("empty command".to_string()));
    }
    if request.timeout.is_zero() {
        return Err(SandboxError::InvalidRequest("timeout must be > 0".to_string()));
    }
    if !request.workdir.is_dir() {
        return Err(SandboxError::InvalidRequest(format!(
            "workdir {} is not a directory",
            request.workdir.display()
        )));
    }
    Ok(())
}

/// Absolute form of the workdir, as required for bind mounts.
pub(crate) fn absolute_workdir(workdir: &Path) -> Result<PathBuf, SandboxError> {
    std::fs::canonicalize(workdir).map_err(|err| {
        SandboxError::InvalidRequest(format!("resolve workdir {}: {err}", workdir.display()))
    })
}
