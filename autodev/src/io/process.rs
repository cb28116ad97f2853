//! Child processes with a wall-clock limit and bounded output capture.
//!
//! Both pipes are drained on their own threads while the child runs, so a
//! chatty command can never block on a full pipe. Only the first
//! `output_limit_bytes` of each stream are kept.

use std::io::Read;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK: usize = 8192;

/// How a timed-out child is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillScope {
    /// Kill only the direct child.
    Child,
    /// Spawn the child as a process-group leader and kill the whole group,
    /// both on timeout and after a normal exit (stray background jobs).
    ProcessGroup,
}

/// Bytes kept from one stream, plus how many were dropped past the limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Capture {
    fn drain<R: Read>(mut source: R, limit: usize) -> Result<Self> {
        let mut capture = Capture::default();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let read = source.read(&mut chunk).context("read output")?;
            if read == 0 {
                return Ok(capture);
            }
            let room = limit.saturating_sub(capture.bytes.len()).min(read);
            capture.bytes.extend_from_slice(&chunk[..room]);
            capture.dropped += read - room;
        }
    }

    /// Lossy UTF-8 text with a trailing marker when bytes were dropped.
    pub fn text(&self, stream: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[{stream} truncated {} bytes]\n", self.dropped));
        }
        text
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Capture,
    pub stderr: Capture,
    pub timed_out: bool,
    pub duration: Duration,
    /// Pid of the direct child (process-group id under [`KillScope::ProcessGroup`]).
    pub pid: u32,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        self.stdout.text("stdout")
    }

    pub fn stderr_lossy(&self) -> String {
        self.stderr.text("stderr")
    }
}

struct Drains {
    stdout: JoinHandle<Result<Capture>>,
    stderr: JoinHandle<Result<Capture>>,
}

impl Drains {
    fn start(child: &mut Child, limit: usize) -> Result<Self> {
        let stdout: ChildStdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr: ChildStderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        Ok(Self {
            stdout: thread::spawn(move || Capture::drain(stdout, limit)),
            stderr: thread::spawn(move || Capture::drain(stderr, limit)),
        })
    }

    fn finish(self) -> Result<(Capture, Capture)> {
        let stdout = join(self.stdout).context("join stdout")?;
        let stderr = join(self.stderr).context("join stderr")?;
        Ok((stdout, stderr))
    }
}

fn join(handle: JoinHandle<Result<Capture>>) -> Result<Capture> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

/// Run `cmd` for at most `timeout`, capturing both streams.
///
/// A timeout is not an error: the child (or its group) is killed and
/// `timed_out` is set. Errors are spawn, wait and reader failures.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, scope = ?scope))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    scope: KillScope,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if scope == KillScope::ProcessGroup {
        isolate_process_group(&mut cmd);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "spawn failed");
        anyhow!(err).context("spawn command")
    })?;
    let pid = child.id();
    debug!(pid, "child spawned");
    let drains = Drains::start(&mut child, output_limit_bytes)?;

    let finished = child.wait_timeout(timeout).context("wait for command")?;
    let timed_out = finished.is_none();
    if timed_out {
        warn!(timeout_secs = timeout.as_secs(), pid, "command timed out, killing");
    }
    let status = match (finished, scope) {
        (Some(status), KillScope::Child) => status,
        (Some(status), KillScope::ProcessGroup) => {
            // leftovers still hold the pipes open; reap them too
            kill_process_group(pid);
            status
        }
        (None, KillScope::Child) => {
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
        (None, KillScope::ProcessGroup) => {
            kill_process_group(pid);
            child.wait().context("wait command after kill")?
        }
    };
    let duration = started.elapsed();

    let (stdout, stderr) = drains.finish()?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }
    debug!(
        exit_code = ?status.code(),
        timed_out,
        elapsed_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
        duration,
        pid,
    })
}

/// Exit code of a finished process; `128 + signal` when killed by a signal.
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// SIGKILL every process in the group led by `pgid`. Errors are logged only;
/// an already-empty group is the common case after a clean exit.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) {
    let target = format!("-{pgid}");
    match Command::new("kill")
        .args(["-9", "--", &target])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!(pgid, "killed process group"),
        Ok(_) => debug!(pgid, "process group already gone"),
        Err(err) => warn!(pgid, err = %err, "failed to run kill for process group"),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(pgid: u32) {
    warn!(pgid, "process-group kill is unsupported on this platform");
}
