//! Host sandbox: `sh -c` in its own process group with a memory ulimit.
//!
//! Weaker than the container runtime (no network or filesystem isolation),
//! but it needs nothing beyond a POSIX shell. The whole process group is
//! killed when the command finishes or times out.

use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::io::config::SandboxConfig;
use crate::io::process::{KillScope, run_command_with_timeout};
use crate::io::sandbox::{ExecutionResult, Sandbox, SandboxError, SandboxRequest, validate_request};

const SHELL: &str = "sh";

#[derive(Debug, Clone)]
pub struct LocalSandbox {
    memory_mb: u64,
    output_limit_bytes: usize,
}

impl LocalSandbox {
    pub fn from_config(config: &SandboxConfig) -> Self {
        if !config.network {
            warn!("local sandbox runtime cannot disable network access");
        }
        Self {
            memory_mb: config.memory_mb,
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    /// Shell script with the memory limit applied before the user command.
    pub fn wrapped_command(&self, command: &str) -> String {
        let kib = self.memory_mb.saturating_mul(1024);
        format!("ulimit -v {kib} 2>/dev/null; {command}")
    }
}

impl Sandbox for LocalSandbox {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        validate_request(request)?;
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(self.wrapped_command(&request.command))
            .current_dir(&request.workdir);
        let output = run_command_with_timeout(
            cmd,
            request.timeout,
            self.output_limit_bytes,
            KillScope::ProcessGroup,
        )
        .map_err(|err| SandboxError::Unavailable(format!("{SHELL} not usable: {err:#}")))?;
        let result = ExecutionResult::from_output(&output);
        debug!(pgid = output.pid, exit_code = result.exit_code, timed_out = result.timed_out, "local sandbox finished");
        Ok(result)
    }

    fn check_available(&self) -> Result<String, SandboxError> {
        let mut cmd = Command::new(SHELL);
        cmd.args(["-c", "true"]);
        let output = run_command_with_timeout(cmd, Duration::from_secs(5), 1024, KillScope::Child)
            .map_err(|err| SandboxError::Unavailable(format!("{SHELL} not usable: {err:#}")))?;
        if !output.status.success() {
            return Err(SandboxError::Unavailable(format!("{SHELL} -c true failed")));
        }
        Ok("local process-group sandbox".to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use super::*;
    use crate::io::sandbox::TIMEOUT_EXIT_CODE;

    fn sandbox() -> LocalSandbox {
        LocalSandbox::from_config(&SandboxConfig::default())
    }

    #[test]
    fn runs_in_workdir_and_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("marker.txt"), "hello").expect("write");
        let result = sandbox()
            .execute(&SandboxRequest::new(
                "cat marker.txt; exit 4",
                temp.path(),
                Duration::from_secs(10),
            ))
            .expect("execute");
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.exit_code, 4);
        assert!(!result.timed_out);
    }

    #[test]
    fn timeout_reports_minus_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = sandbox()
            .execute(&SandboxRequest::new(
                "sleep 20",
                temp.path(),
                Duration::from_millis(300),
            ))
            .expect("execute");
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.duration_secs < 10.0);
    }

    #[test]
    fn wraps_command_with_memory_limit() {
        assert_eq!(
            sandbox().wrapped_command("pytest"),
            "ulimit -v 524288 2>/dev/null; pytest"
        );
    }

    #[test]
    fn shell_is_available() {
        assert!(sandbox().check_available().is_ok());
    }
}
