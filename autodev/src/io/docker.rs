//! Docker-backed sandbox: one throwaway container per command.
//!
//! The container is named uniquely, labelled for discovery, bind-mounts the
//! workspace at `/workspace`, and is force-removed by [`ContainerGuard`] when
//! `execute` returns, whatever the outcome.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, instrument, warn};

use crate::core::path::GIT_DIR;
use crate::io::config::SandboxConfig;
use crate::io::process::{CommandOutput, KillScope, exit_code_of, run_command_with_timeout};
use crate::io::sandbox::{
    CONTAINER_WORKDIR, ExecutionResult, Sandbox, SandboxError, SandboxRequest, absolute_workdir,
    validate_request,
};

/// Label set on every sandbox container.
pub const SANDBOX_LABEL: &str = "autodev.sandbox";

/// `docker run` exits with 125 when the daemon could not start the container.
const DOCKER_RUN_FAILURE: i32 = 125;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_OUTPUT_LIMIT: usize = 64 * 1024;
const PIDS_LIMIT: u32 = 256;

const UNAVAILABLE_MARKERS: [&str; 9] = [
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
    "permission denied while trying to connect",
    "credential",
    "credsstore",
    "unauthorized",
    "pull access denied",
    "manifest unknown",
];

#[derive(Debug, Clone)]
pub struct DockerSandbox {
    binary: String,
    image: String,
    memory_mb: u64,
    cpu_percent: u32,
    network: bool,
    output_limit_bytes: usize,
    auto_pull: bool,
}

impl DockerSandbox {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            binary: "docker".to_string(),
            image: config.image.clone(),
            memory_mb: config.memory_mb,
            cpu_percent: config.cpu_percent,
            network: config.network,
            output_limit_bytes: config.output_limit_bytes,
            auto_pull: config.auto_pull,
        }
    }

    /// Use a different docker-compatible CLI (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Arguments for `docker run` (without the binary).
    pub fn run_args(&self, name: &str, workdir: &Path, command: &str) -> Vec<String> {
        let memory = format!("{}m", self.memory_mb);
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("{SANDBOX_LABEL}=1"),
        ];
        if !self.network {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        args.extend([
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            "--cpus".to_string(),
            cpus_arg(self.cpu_percent),
            "--pids-limit".to_string(),
            PIDS_LIMIT.to_string(),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKDIR}:rw", workdir.display()),
        ]);
        // repository metadata is read on the host by git; keep it out of reach
        let git_dir = workdir.join(GIT_DIR);
        if git_dir.exists() {
            args.extend([
                "-v".to_string(),
                format!("{}:{CONTAINER_WORKDIR}/.git:ro", git_dir.display()),
            ]);
        }
        args.extend([
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
            self.image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        args
    }

    /// Names of all containers carrying the sandbox label, running or not.
    pub fn list_sandbox_containers(&self) -> Result<Vec<String>, SandboxError> {
        let filter = format!("label={SANDBOX_LABEL}");
        let output = self.probe(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])?;
        Ok(String::from_utf8_lossy(&output.stdout.bytes)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn ensure_image(&self) -> Result<(), SandboxError> {
        if self
            .probe(&["image", "inspect", "--format", "{{.Id}}", &self.image])
            .is_ok()
        {
            return Ok(());
        }
        if !self.auto_pull {
            return Err(SandboxError::Unavailable(format!(
                "image {} not present and auto_pull is disabled",
                self.image
            )));
        }
        info!(image = %self.image, "pulling sandbox image");
        let output = self.docker_cli(&["pull", &self.image], PULL_TIMEOUT)?;
        if output.timed_out || !output.status.success() {
            return Err(SandboxError::Unavailable(format!(
                "pull {}: {}",
                self.image,
                output.stderr_lossy().trim()
            )));
        }
        Ok(())
    }

    /// Short docker call that must succeed; any failure means unavailable.
    fn probe(&self, args: &[&str]) -> Result<CommandOutput, SandboxError> {
        let output = self.docker_cli(args, PROBE_TIMEOUT)?;
        if output.timed_out {
            return Err(SandboxError::Unavailable(format!(
                "{} {} timed out",
                self.binary,
                args.join(" ")
            )));
        }
        if !output.status.success() {
            return Err(SandboxError::Unavailable(
                output.stderr_lossy().trim().to_string(),
            ));
        }
        Ok(output)
    }

    fn docker_cli(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput, SandboxError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        run_command_with_timeout(cmd, timeout, PROBE_OUTPUT_LIMIT, KillScope::Child).map_err(
            |err| SandboxError::Unavailable(format!("{} not usable: {err:#}", self.binary)),
        )
    }

    fn remove_container(&self, name: &str) {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["rm", "-f", name]);
        match run_command_with_timeout(cmd, REMOVE_TIMEOUT, PROBE_OUTPUT_LIMIT, KillScope::Child) {
            Ok(output) if output.status.success() => debug!(container = name, "container removed"),
            Ok(output) => {
                let stderr = output.stderr_lossy();
                if stderr.to_lowercase().contains("no such container") {
                    debug!(container = name, "container never started");
                } else {
                    warn!(container = name, stderr = %stderr.trim(), "container removal failed");
                }
            }
            Err(err) => warn!(container = name, err = %err, "container removal failed"),
        }
    }
}

impl Sandbox for DockerSandbox {
    #[instrument(skip_all, fields(image = %self.image, timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        validate_request(request)?;
        let workdir = absolute_workdir(&request.workdir)?;
        self.check_available()?;
        self.ensure_image()?;

        let name = container_name();
        let guard = ContainerGuard {
            sandbox: self,
            name: name.clone(),
        };

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.run_args(&name, &workdir, &request.command));
        debug!(container = %name, "starting sandbox container");
        let output = run_command_with_timeout(
            cmd,
            request.timeout,
            self.output_limit_bytes,
            KillScope::Child,
        )
        .map_err(|err| SandboxError::Unavailable(format!("{} not usable: {err:#}", self.binary)))?;

        if !output.timed_out && exit_code_of(&output.status) == DOCKER_RUN_FAILURE {
            let stderr = output.stderr_lossy();
            if stderr.contains("docker:") || is_unavailable_message(&stderr) {
                return Err(SandboxError::Unavailable(stderr.trim().to_string()));
            }
        }

        let result = ExecutionResult::from_output(&output);
        drop(guard);
        debug!(exit_code = result.exit_code, timed_out = result.timed_out, "sandbox finished");
        Ok(result)
    }

    fn check_available(&self) -> Result<String, SandboxError> {
        let output = self
            .probe(&["version", "--format", "{{.Server.Version}}"])
            .map_err(|err| match err {
                SandboxError::Unavailable(msg) if msg.is_empty() => {
                    SandboxError::Unavailable("docker daemon not reachable".to_string())
                }
                other => other,
            })?;
        let version = String::from_utf8_lossy(&output.stdout.bytes).trim().to_string();
        Ok(format!("docker {version}"))
    }
}

/// Force-removes its container when dropped.
struct ContainerGuard<'a> {
    sandbox: &'a DockerSandbox,
    name: String,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        self.sandbox.remove_container(&self.name);
    }
}

fn container_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("autodev-sandbox-{}", suffix.to_lowercase())
}

fn cpus_arg(percent: u32) -> String {
    format!("{}.{:02}", percent / 100, percent % 100)
}

/// True if docker's stderr says the runtime, not the command, is the problem.
pub fn is_unavailable_message(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    UNAVAILABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}
