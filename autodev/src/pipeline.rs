//! Pipeline Coordinator: Plan -> Apply -> Validate -> Decide -> (Apply | Publish | Stop).
//!
//! The coordinator is the only code that advances [`RunStatus`] or consumes
//! attempts. Collaborators return data; every expected failure ends up in
//! the [`RunState`]. `run` returns `Err` only for programming errors.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Result, anyhow};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, instrument, warn};

use crate::core::changeset::ParseMethod;
use crate::core::decision::{NextStage, decide};
use crate::core::invariants::validate_run_state;
use crate::core::path::normalize_relative;
use crate::core::plan::fallback_plan;
use crate::core::pull_request::{commit_message, pr_body, pr_title};
use crate::core::run_state::RunState;
use crate::core::transition::check_transition;
use crate::core::types::{AppliedChange, RunStatus, ValidationReport};
use crate::io::apply::{WriteFailure, apply_payload};
use crate::io::config::{AutodevConfig, ScanConfig};
use crate::io::files::{contained_path, list_files, read_key_files, read_text, render_tree};
use crate::io::generator::Generator;
use crate::io::git::SourceControl;
use crate::io::github::{Publisher, PullRequestRequest, parse_github_url};
use crate::io::prompt::{ChangeRequest, PlanRequest};
use crate::io::run_log::{AttemptMeta, AttemptRecord, RunLog, timestamp};
use crate::io::validation::Validator;
use crate::status::StatusWriter;

/// Base branch used when neither config nor the clone names one.
pub const DEFAULT_BASE_BRANCH: &str = "main";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    /// Parent of per-run workspaces and of `.autodev/runs`.
    pub workspace_root: PathBuf,
    pub base_branch: Option<String>,
    pub backup_existing: bool,
    pub scan: ScanConfig,
}

impl PipelineConfig {
    pub fn from_config(config: &AutodevConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            workspace_root: config.workspace_root.clone(),
            base_branch: config.github.base_branch.clone(),
            backup_existing: config.apply.backup_existing,
            scan: config.scan.clone(),
        }
    }
}

/// Work carried from Apply through Decide for one attempt.
#[derive(Debug)]
struct Attempt {
    number: u32,
    started_at: String,
    started: Instant,
    parse_method: Option<ParseMethod>,
    applied: Vec<AppliedChange>,
    failures: Vec<WriteFailure>,
    /// Set when the attempt failed before validation could run.
    report: Option<ValidationReport>,
}

#[derive(Debug)]
enum Stage {
    Plan,
    Apply,
    Validate(Attempt),
    Decide(Attempt),
    Publish,
    Done,
}

pub struct Pipeline<G, V, C, P> {
    config: PipelineConfig,
    generator: G,
    validator: V,
    scm: C,
    publisher: P,
    status: Option<StatusWriter>,
    run_log: bool,
}

impl<G, V, C, P> Pipeline<G, V, C, P>
where
    G: Generator,
    V: Validator,
    C: SourceControl,
    P: Publisher,
{
    pub fn new(config: PipelineConfig, generator: G, validator: V, scm: C, publisher: P) -> Self {
        Self {
            config,
            generator,
            validator,
            scm,
            publisher,
            status: None,
            run_log: true,
        }
    }

    /// Mirror status and log lines to a job status surface.
    pub fn with_status(mut self, writer: StatusWriter) -> Self {
        self.status = Some(writer);
        self
    }

    /// Enable or disable per-attempt artifacts under the workspace root.
    pub fn with_run_log(mut self, enabled: bool) -> Self {
        self.run_log = enabled;
        self
    }

    /// Drive `state` to a terminal status.
    #[instrument(skip_all, fields(run_id = %state.run_id))]
    pub fn run(&mut self, mut state: RunState) -> Result<RunState> {
        if state.status() != RunStatus::Initialized {
            return Err(anyhow!("run {} already started ({})", state.run_id, state.status()));
        }
        let max = self.config.max_attempts;
        // plan, 3 stages per attempt, publish, done
        let bound = 3 * max as usize + 3;
        let mut stage = Stage::Plan;
        for _ in 0..bound {
            debug!(stage = ?stage, "entering stage");
            stage = match stage {
                Stage::Plan => self.plan(&mut state)?,
                Stage::Apply => self.apply(&mut state)?,
                Stage::Validate(attempt) => self.validate(&mut state, attempt)?,
                Stage::Decide(attempt) => self.decide(&mut state, attempt)?,
                Stage::Publish => self.publish(&mut state)?,
                Stage::Done => return self.finish(state),
            };
        }
        match stage {
            Stage::Done => self.finish(state),
            _ => Err(anyhow!("stage loop exceeded {bound} steps")),
        }
    }

    fn plan(&mut self, state: &mut RunState) -> Result<Stage> {
        self.advance(state, RunStatus::Planning)?;

        let workspace = match state.workspace() {
            Some(existing) => existing.to_path_buf(),
            None => {
                let dest = self
                    .config
                    .workspace_root
                    .join(workspace_dir_name(&state.repo_url, &state.run_id));
                self.log(format!("Cloning {} into {}", state.repo_url, dest.display()));
                if let Err(err) = self.scm.clone_repo(&state.repo_url, &dest) {
                    return self.fail(state, format!("clone failed: {err:#}"));
                }
                state.set_workspace(&dest)?;
                dest
            }
        };

        let base = match &self.config.base_branch {
            Some(base) => Ok(base.clone()),
            None => self.scm.current_branch(&workspace),
        };
        match base {
            Ok(base) => state.base_branch = Some(base),
            Err(err) => return self.fail(state, format!("could not resolve base branch: {err:#}")),
        }
        if let Err(err) = self.scm.prepare_branch(&workspace, &state.branch) {
            return self.fail(state, format!("branch {} failed: {err:#}", state.branch));
        }
        self.log(format!("Working on branch {}", state.branch));

        state.file_map = match list_files(&workspace, &self.config.scan) {
            Ok(files) => files,
            Err(err) => return self.fail(state, format!("file scan failed: {err:#}")),
        };
        self.log(format!("Scanned {} files", state.file_map.len()));

        let request = PlanRequest {
            task: state.task.clone(),
            tree: render_tree(&state.file_map, self.config.scan.max_tree_entries),
            key_files: read_key_files(&workspace, &state.file_map),
        };
        let plan = match self.generator.plan(&request) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(err = %err, "planning failed, using fallback plan");
                self.log(format!("Planning failed ({err:#}); using fallback plan"));
                fallback_plan(&state.file_map, &self.config.scan.source_extensions)
            }
        };

        state.plan = plan.steps;
        state.relevant_files = plan
            .relevant_files
            .iter()
            .filter_map(|path| normalize_relative(path).ok())
            .take(self.config.scan.max_relevant_files)
            .collect();
        for path in &state.relevant_files {
            match contained_path(&workspace, path).and_then(|target| read_text(&target)) {
                Ok(content) => {
                    state.file_contents.insert(path.clone(), content);
                }
                Err(err) => debug!(path = %path, err = %err, "relevant file not readable"),
            }
        }
        self.log(format!(
            "Plan has {} steps over {} relevant files",
            state.plan.len(),
            state.relevant_files.len()
        ));
        Ok(Stage::Apply)
    }

    fn apply(&mut self, state: &mut RunState) -> Result<Stage> {
        self.advance(state, RunStatus::Applying)?;
        let Some(workspace) = state.workspace().map(Path::to_path_buf) else {
            return self.fail(state, "workspace missing".to_string());
        };

        let number = state.attempt_count() + 1;
        self.log(format!(
            "Attempt {number}/{}: generating changes",
            self.config.max_attempts
        ));
        let mut attempt = Attempt {
            number,
            started_at: timestamp(),
            started: Instant::now(),
            parse_method: None,
            applied: Vec::new(),
            failures: Vec::new(),
            report: None,
        };

        let request = ChangeRequest {
            task: state.task.clone(),
            plan: state.plan.clone(),
            files: state
                .file_contents
                .iter()
                .map(|(path, content)| (path.clone(), content.clone()))
                .collect(),
            attempt: number,
            max_attempts: self.config.max_attempts,
            previous_transcript: (state.attempt_count() > 0)
                .then(|| state.last_transcript.clone()),
            error_history: state.error_history().to_vec(),
        };

        let raw = match self.generator.generate_changes(&request) {
            Ok(raw) => raw,
            Err(err) => {
                self.log(format!("Change generation failed: {err:#}"));
                attempt.report = Some(ValidationReport::synthetic_failure(format!(
                    "=== GENERATION ERROR ===\nerror: change generation failed: {err:#}\n"
                )));
                return Ok(Stage::Validate(attempt));
            }
        };

        match apply_payload(&workspace, &raw, self.config.backup_existing) {
            Err(err) => {
                self.log(format!("Change set unusable: {err}"));
                attempt.report = Some(ValidationReport::synthetic_failure(format!(
                    "=== CHANGE SET ERROR ===\nerror: {err}\n"
                )));
            }
            Ok(report) => {
                state.record_changes(&report.applied, &report.contents);
                for change in &report.applied {
                    self.log(format!("  {} {}", change.kind, change.path));
                }
                for failure in &report.failures {
                    self.log(format!("  failed {}: {}", failure.path, failure.error));
                }
                if report.applied.is_empty() {
                    let reasons: Vec<String> = report
                        .failures
                        .iter()
                        .map(|f| format!("{}: {}", f.path, f.error))
                        .collect();
                    attempt.report = Some(ValidationReport::synthetic_failure(format!(
                        "=== APPLY ERROR ===\nerror: no change could be applied ({})\n",
                        reasons.join("; ")
                    )));
                }
                attempt.parse_method = Some(report.method);
                attempt.applied = report.applied;
                attempt.failures = report.failures;
            }
        }
        Ok(Stage::Validate(attempt))
    }

    fn validate(&mut self, state: &mut RunState, mut attempt: Attempt) -> Result<Stage> {
        self.advance(state, RunStatus::Validating)?;

        let report = match attempt.report.take() {
            Some(report) => {
                self.log("Skipping validation: attempt failed before any check could run");
                report
            }
            None => {
                let Some(workspace) = state.workspace().map(Path::to_path_buf) else {
                    return self.fail(state, "workspace missing".to_string());
                };
                self.log("Validating in sandbox");
                match self.validator.validate(&workspace) {
                    Ok(report) => report,
                    Err(err) => return self.fail(state, format!("validation could not run: {err:#}")),
                }
            }
        };

        if report.degraded {
            warn!(exit_code = report.exit_code, "validation degraded");
            self.log(format!(
                "Sandbox unavailable; validation skipped (exit code {})",
                report.exit_code
            ));
        } else {
            self.log(format!("Validation exit code {}", report.exit_code));
        }
        state.record_validation(attempt.number, &report);
        attempt.report = Some(report);
        Ok(Stage::Decide(attempt))
    }

    fn decide(&mut self, state: &mut RunState, attempt: Attempt) -> Result<Stage> {
        let Some(report) = attempt.report.as_ref() else {
            return Err(anyhow!("attempt {} reached decide without a report", attempt.number));
        };
        let decision = decide(
            report.exit_code,
            &report.transcript,
            state.attempt_count(),
            self.config.max_attempts,
        );
        info!(
            next = decision.next.as_str(),
            attempts = decision.attempt_count,
            "decision"
        );
        state.record_decision(decision.attempt_count, decision.error_entry.clone());
        self.write_attempt_log(state, &attempt, report, decision.next, decision.error_entry.as_deref());

        match decision.next {
            NextStage::Publish => {
                self.log("Validation passed");
                Ok(Stage::Publish)
            }
            NextStage::Retry => {
                self.log(format!(
                    "Validation failed: {}",
                    decision.error_entry.as_deref().unwrap_or_default()
                ));
                Ok(Stage::Apply)
            }
            NextStage::Fail => {
                self.log(format!(
                    "Validation failed after {} attempts; giving up",
                    decision.attempt_count
                ));
                self.advance(state, RunStatus::Failed)?;
                Ok(Stage::Done)
            }
        }
    }

    fn publish(&mut self, state: &mut RunState) -> Result<Stage> {
        self.advance(state, RunStatus::Publishing)?;
        let Some(workspace) = state.workspace().map(Path::to_path_buf) else {
            return self.fail(state, "workspace missing".to_string());
        };

        let message = commit_message(&state.task, &state.changes);
        match self.scm.commit_all(&workspace, &message) {
            Ok(Some(sha)) => self.log(format!("Committed {sha}")),
            Ok(None) => {
                warn!("nothing to commit");
                self.log("No changes to commit");
            }
            Err(err) => return self.fail(state, format!("commit failed: {err:#}")),
        }

        if let Err(err) = self.scm.push(&workspace, &state.repo_url, &state.branch) {
            return self.fail(state, format!("push failed: {err:#}"));
        }
        self.log(format!("Pushed {}", state.branch));

        let request = PullRequestRequest {
            title: pr_title(&state.task),
            body: pr_body(state),
            head_branch: state.branch.clone(),
            base_branch: state
                .base_branch
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
        };
        match self
            .publisher
            .create_or_update_pull_request(&state.repo_url, &request)
        {
            Ok(pr) => {
                let verb = if pr.created { "Created" } else { "Updated" };
                self.log(format!("{verb} pull request #{}: {}", pr.number, pr.url));
                state.result_url = Some(pr.url);
            }
            Err(err) => return self.fail(state, format!("pull request failed: {err:#}")),
        }
        self.advance(state, RunStatus::Completed)?;
        Ok(Stage::Done)
    }

    fn finish(&mut self, state: RunState) -> Result<RunState> {
        if self.run_log {
            let log = RunLog::new(&self.config.workspace_root, &state.run_id);
            if let Err(err) = log.write_summary(&state) {
                warn!(err = %err, "run summary not written");
            }
        }
        let violations = validate_run_state(&state, self.config.max_attempts);
        if !violations.is_empty() {
            return Err(anyhow!(
                "run state invariants violated:\n- {}",
                violations.join("\n- ")
            ));
        }
        match state.status() {
            RunStatus::Completed => self.log(format!(
                "Run completed: {}",
                state.result_url.as_deref().unwrap_or_default()
            )),
            status => self.log(format!(
                "Run {status}: {}",
                state
                    .fatal_error
                    .as_deref()
                    .or(state.last_error())
                    .unwrap_or_default()
            )),
        }
        if let Some(writer) = self.status.take() {
            writer.finish(state.status(), state.result_url.clone());
        }
        Ok(state)
    }

    /// Record an infrastructure failure and stop without consuming attempts.
    fn fail(&mut self, state: &mut RunState, reason: String) -> Result<Stage> {
        warn!(reason = %reason, "run failed");
        self.log(format!("Fatal: {reason}"));
        state.fatal_error = Some(reason);
        self.advance(state, RunStatus::Failed)?;
        Ok(Stage::Done)
    }

    fn advance(&mut self, state: &mut RunState, to: RunStatus) -> Result<()> {
        let from = state.status();
        check_transition(from, to, state.attempt_count(), self.config.max_attempts)?;
        info!(%from, %to, "status transition");
        state.set_status(to);
        if let Some(writer) = &self.status {
            writer.set_status(to);
        }
        Ok(())
    }

    fn log(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{line}");
        if let Some(writer) = &self.status {
            writer.log(line);
        }
    }

    fn write_attempt_log(
        &self,
        state: &RunState,
        attempt: &Attempt,
        report: &ValidationReport,
        next: NextStage,
        error_entry: Option<&str>,
    ) {
        if !self.run_log {
            return;
        }
        let meta = AttemptMeta {
            run_id: state.run_id.clone(),
            attempt: attempt.number,
            exit_code: report.exit_code,
            degraded: report.degraded,
            parse_method: attempt.parse_method,
            decision: next,
            error_entry: error_entry.map(str::to_string),
            started_at: attempt.started_at.clone(),
            ended_at: timestamp(),
            duration_ms: u64::try_from(attempt.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        let log = RunLog::new(&self.config.workspace_root, &state.run_id);
        if let Err(err) = log.write_attempt(&AttemptRecord {
            meta: &meta,
            applied: &attempt.applied,
            failures: &attempt.failures,
            transcript: &report.transcript,
        }) {
            warn!(err = %err, attempt = attempt.number, "attempt log not written");
        }
    }
}

/// Fresh run id: UTC timestamp plus a random suffix.
pub fn new_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S"),
        suffix.to_lowercase()
    )
}

/// `<repo>-<run_id>`, with the repository name reduced to safe characters.
pub fn workspace_dir_name(repo_url: &str, run_id: &str) -> String {
    let name = match parse_github_url(repo_url) {
        Ok(slug) => slug.name,
        Err(_) => repo_url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default()
            .trim_end_matches(".git")
            .to_string(),
    };
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let safe = safe.trim_matches('-');
    if safe.is_empty() {
        format!("repo-{run_id}")
    } else {
        format!("{safe}-{run_id}")
    }
}
