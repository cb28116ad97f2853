//! Test-only fakes for the pipeline's seams, plus local git and HTTP fixtures.

use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::plan::Plan;
use crate::core::types::ValidationReport;
use crate::io::generator::Generator;
use crate::io::git::{Git, Identity, SourceControl};
use crate::io::github::{Publisher, PullRequest, PullRequestRequest};
use crate::io::prompt::{ChangeRequest, PlanRequest};
use crate::io::sandbox::{ExecutionResult, Sandbox, SandboxError, SandboxRequest, TIMEOUT_EXIT_CODE};
use crate::io::validation::Validator;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn identity() -> Identity {
    Identity {
        name: "autodev-test".to_string(),
        email: "autodev-test@example.com".to_string(),
    }
}

/// One canned sandbox outcome.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Result(ExecutionResult),
    Unavailable(String),
    RuntimeError(String),
}

impl ScriptedStep {
    pub fn exit(code: i32, stdout: &str) -> Self {
        ScriptedStep::Result(ExecutionResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: code,
            duration_secs: 0.01,
            timed_out: false,
        })
    }

    pub fn timeout() -> Self {
        ScriptedStep::Result(ExecutionResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: TIMEOUT_EXIT_CODE,
            duration_secs: 5.0,
            timed_out: true,
        })
    }

    pub fn unavailable(reason: &str) -> Self {
        ScriptedStep::Unavailable(reason.to_string())
    }

    pub fn runtime_error(message: &str) -> Self {
        ScriptedStep::RuntimeError(message.to_string())
    }
}

/// Sandbox that replays steps in order and records each command.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    steps: Mutex<VecDeque<ScriptedStep>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(&self, request: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        lock(&self.commands).push(request.command.clone());
        match lock(&self.steps).pop_front() {
            Some(ScriptedStep::Result(result)) => Ok(result),
            Some(ScriptedStep::Unavailable(reason)) => Err(SandboxError::Unavailable(reason)),
            Some(ScriptedStep::RuntimeError(message)) => Err(SandboxError::Runtime(anyhow!(message))),
            None => Err(SandboxError::Runtime(anyhow!("no scripted step left"))),
        }
    }

    fn check_available(&self) -> Result<String, SandboxError> {
        Ok("scripted".to_string())
    }
}

/// Generator with one scripted plan and a queue of change payloads.
///
/// Errors are given as strings and turned into `anyhow` errors on use.
#[derive(Debug)]
pub struct ScriptedGenerator {
    plan: Mutex<Option<Result<Plan, String>>>,
    payloads: Mutex<VecDeque<Result<String, String>>>,
    plan_requests: Mutex<Vec<PlanRequest>>,
    change_requests: Mutex<Vec<ChangeRequest>>,
}

impl ScriptedGenerator {
    pub fn new(plan: Result<Plan, String>, payloads: Vec<Result<String, String>>) -> Self {
        Self {
            plan: Mutex::new(Some(plan)),
            payloads: Mutex::new(payloads.into()),
            plan_requests: Mutex::new(Vec::new()),
            change_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn plan_requests(&self) -> Vec<PlanRequest> {
        lock(&self.plan_requests).clone()
    }

    pub fn change_requests(&self) -> Vec<ChangeRequest> {
        lock(&self.change_requests).clone()
    }
}

impl Generator for ScriptedGenerator {
    fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        lock(&self.plan_requests).push(request.clone());
        match lock(&self.plan).take() {
            Some(Ok(plan)) => Ok(plan),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("plan requested twice")),
        }
    }

    fn generate_changes(&self, request: &ChangeRequest) -> Result<String> {
        lock(&self.change_requests).push(request.clone());
        match lock(&self.payloads).pop_front() {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted payload left")),
        }
    }
}

/// Plan naming `files` with a single step.
pub fn plan_for(files: &[&str]) -> Plan {
    Plan {
        relevant_files: files.iter().map(|f| f.to_string()).collect(),
        steps: vec!["Make the requested change".to_string()],
        reasoning: None,
    }
}

/// JSON change payload writing each `(path, content)` pair.
pub fn change_payload(files: &[(&str, &str)]) -> String {
    let changes: Vec<serde_json::Value> = files
        .iter()
        .map(|(path, content)| {
            serde_json::json!({
                "path": path,
                "action": "modify",
                "content": content,
                "description": format!("update {path}"),
            })
        })
        .collect();
    serde_json::json!({ "changes": changes, "explanation": "scripted change" }).to_string()
}

pub fn passing_report() -> ValidationReport {
    ValidationReport {
        transcript: "=== TESTS ===\n1 passed\n".to_string(),
        exit_code: 0,
        degraded: false,
        steps: Vec::new(),
    }
}

pub fn failing_report(exit_code: i32, transcript: &str) -> ValidationReport {
    ValidationReport {
        transcript: transcript.to_string(),
        exit_code,
        degraded: false,
        steps: Vec::new(),
    }
}

/// Validator replaying reports in order.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    reports: Mutex<VecDeque<Result<ValidationReport, String>>>,
    calls: Mutex<Vec<PathBuf>>,
}

impl ScriptedValidator {
    pub fn new(reports: Vec<Result<ValidationReport, String>>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, workdir: &Path) -> Result<ValidationReport> {
        lock(&self.calls).push(workdir.to_path_buf());
        match lock(&self.reports).pop_front() {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted report left")),
        }
    }
}

/// In-memory source control: cloning writes seed files, commits and pushes
/// are recorded.
#[derive(Debug, Default)]
pub struct FakeSourceControl {
    seed: Vec<(String, String)>,
    fail_clone: bool,
    fail_push: bool,
    nothing_to_commit: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeSourceControl {
    pub fn new(seed: &[(&str, &str)]) -> Self {
        Self {
            seed: seed
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn failing_clone(mut self) -> Self {
        self.fail_clone = true;
        self
    }

    pub fn failing_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub fn with_nothing_to_commit(mut self) -> Self {
        self.nothing_to_commit = true;
        self
    }

    /// Calls in order, e.g. `clone <url>`, `branch <name>`, `commit <msg>`, `push <branch>`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

impl SourceControl for FakeSourceControl {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        self.record(format!("clone {url}"));
        if self.fail_clone {
            return Err(anyhow!("repository not found: {url}"));
        }
        for (path, content) in &self.seed {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create seed dir")?;
            }
            fs::write(&target, content).context("write seed file")?;
        }
        fs::create_dir_all(dest).context("create clone dir")?;
        Ok(())
    }

    fn current_branch(&self, _workdir: &Path) -> Result<String> {
        Ok("main".to_string())
    }

    fn prepare_branch(&self, _workdir: &Path, branch: &str) -> Result<()> {
        self.record(format!("branch {branch}"));
        Ok(())
    }

    fn commit_all(&self, _workdir: &Path, message: &str) -> Result<Option<String>> {
        self.record(format!("commit {message}"));
        if self.nothing_to_commit {
            return Ok(None);
        }
        Ok(Some("0123abc".to_string()))
    }

    fn push(&self, _workdir: &Path, _url: &str, branch: &str) -> Result<()> {
        self.record(format!("push {branch}"));
        if self.fail_push {
            return Err(anyhow!("remote rejected {branch}"));
        }
        Ok(())
    }
}

/// Publisher that records requests and returns a fixed pull request.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    fail: Option<String>,
    requests: Mutex<Vec<(String, PullRequestRequest)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<(String, PullRequestRequest)> {
        lock(&self.requests).clone()
    }
}

pub const FAKE_PR_URL: &str = "https://github.com/octo/demo/pull/1";

impl Publisher for RecordingPublisher {
    fn create_or_update_pull_request(
        &self,
        repo_url: &str,
        request: &PullRequestRequest,
    ) -> Result<PullRequest> {
        lock(&self.requests).push((repo_url.to_string(), request.clone()));
        if let Some(message) = &self.fail {
            return Err(anyhow!(message.clone()));
        }
        Ok(PullRequest {
            url: FAKE_PR_URL.to_string(),
            number: 1,
            created: true,
        })
    }
}

/// Bare git remote on disk seeded with one commit on `main`.
pub struct TestRepo {
    temp: TempDir,
    remote: PathBuf,
}

impl TestRepo {
    pub fn new(files: &[(&str, &str)]) -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let seed = temp.path().join("seed");
        fs::create_dir_all(&seed).context("create seed dir")?;
        let git = Git::new(&seed).with_identity(identity());
        git.run_checked(&["init", "-b", "main"])?;
        for (path, content) in files {
            let target = seed.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create seed parent")?;
            }
            fs::write(&target, content).with_context(|| format!("write {path}"))?;
        }
        git.add_all()?;
        git.commit_staged("seed")?;
        Git::new(temp.path()).run_checked(&["clone", "--bare", "seed", "remote.git"])?;
        let remote = temp.path().join("remote.git");
        Ok(Self { temp, remote })
    }

    pub fn url(&self) -> String {
        self.remote.to_string_lossy().to_string()
    }

    /// Scratch directory next to the remote, usable as a workspace root.
    pub fn scratch(&self) -> PathBuf {
        self.temp.path().join("scratch")
    }

    /// Content of `path` at the tip of `branch` on the remote.
    pub fn show(&self, branch: &str, path: &str) -> Result<String> {
        let output = Git::new(&self.remote).run_checked(&["show", &format!("{branch}:{path}")])?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// A request seen by [`MockHttpServer`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl SeenRequest {
    /// Header value, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

/// Single-threaded HTTP server answering with canned `(status, body)` pairs,
/// one connection per response.
pub struct MockHttpServer {
    addr: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Vec<SeenRequest>>>,
}

impl MockHttpServer {
    pub fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr").to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let stream = loop {
                    match listener.accept() {
                        Ok((stream, _)) => break stream,
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            if flag.load(Ordering::SeqCst) {
                                return seen;
                            }
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => return seen,
                    }
                };
                if let Ok(request) = serve(stream, status, &body) {
                    seen.push(request);
                }
            }
            seen
        });
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting and return every request served.
    pub fn finish(mut self) -> Vec<SeenRequest> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle
            .take()
            .map(|h| h.join().expect("mock server thread"))
            .unwrap_or_default()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn serve(stream: TcpStream, status: u16, body: &str) -> std::io::Result<SeenRequest> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    let length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut buf = vec![0u8; length];
    reader.read_exact(&mut buf)?;

    let reason = match status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        422 => "Unprocessable Entity",
        _ => "Error",
    };
    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()?;

    Ok(SeenRequest {
        request_line: request_line.trim_end().to_string(),
        headers,
        body: String::from_utf8_lossy(&buf).to_string(),
    })
}
