//! End-to-end pipeline scenarios driven by scripted collaborators.
//!
//! Each test runs `Pipeline::run` to a terminal status with a fake source
//! control (seed files written on clone), a scripted generator and a scripted
//! validator, then checks the final `RunState`.

use std::fs;
use std::path::Path;

use autodev::core::decision::MAX_RETRIES_EXCEEDED;
use autodev::core::run_state::RunState;
use autodev::core::types::{ChangeKind, RunStatus, ValidationReport};
use autodev::io::config::ScanConfig;
use autodev::pipeline::{Pipeline, PipelineConfig};
use autodev::status::JobStatus;
use autodev::test_support::{
    FAKE_PR_URL, FakeSourceControl, RecordingPublisher, ScriptedGenerator, ScriptedValidator,
    change_payload, failing_report, passing_report, plan_for,
};

const SEED: &[(&str, &str)] = &[
    ("app.py", "def greet():\n    return 'hi'\n"),
    ("README.md", "# Demo\n"),
    ("tests/test_app.py", "from app import greet\n\ndef test_greet():\n    assert greet() == 'hello'\n"),
];

const FIXED: &str = "def greet():\n    return 'hello'\n";

fn config(root: &Path, max_attempts: u32) -> PipelineConfig {
    PipelineConfig {
        max_attempts,
        workspace_root: root.to_path_buf(),
        base_branch: None,
        backup_existing: false,
        scan: ScanConfig::default(),
    }
}

fn state() -> RunState {
    RunState::new(
        "run-1",
        "https://github.com/octo/demo",
        "feat",
        "Make greet return hello",
    )
}

fn fixed_payload() -> Result<String, String> {
    Ok(change_payload(&[("app.py", FIXED)]))
}

fn test_failure(n: u32) -> Result<ValidationReport, String> {
    Ok(failing_report(
        1,
        &format!("=== TESTS ===\nFAILED tests/test_app.py::test_greet\nE   AssertionError: round {n}\n"),
    ))
}

/// Verifies exit code 0 on the first attempt publishes with no attempts consumed.
#[test]
fn passing_first_attempt_publishes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), vec![fixed_payload()]);
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.attempt_count(), 0);
    assert!(state.error_history().is_empty());
    assert_eq!(state.result_url.as_deref(), Some(FAKE_PR_URL));
    assert_eq!(state.base_branch.as_deref(), Some("main"));

    let workspace = temp.path().join("demo-run-1");
    assert_eq!(state.workspace(), Some(workspace.as_path()));
    assert_eq!(fs::read_to_string(workspace.join("app.py")).expect("read"), FIXED);
    assert_eq!(state.changes.len(), 1);
    assert_eq!(state.changes[0].kind, ChangeKind::Modify);
    assert_eq!(state.file_contents.get("app.py").map(String::as_str), Some(FIXED));

    let calls = scm.calls();
    assert_eq!(calls[0], "clone https://github.com/octo/demo");
    assert_eq!(calls[1], "branch feat");
    assert!(calls[2].starts_with("commit "));
    assert_eq!(calls[3], "push feat");

    let requests = publisher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.head_branch, "feat");
    assert_eq!(requests[0].1.base_branch, "main");
    assert!(requests[0].1.title.starts_with("[autodev]"));
}

/// Verifies exit codes [1, 1, 0] retry twice, then publish.
#[test]
fn two_failures_then_pass_publishes_after_retries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(
        Ok(plan_for(&["app.py"])),
        vec![fixed_payload(), fixed_payload(), fixed_payload()],
    );
    let validator =
        ScriptedValidator::new(vec![test_failure(1), test_failure(2), Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.attempt_count(), 2);
    assert_eq!(state.error_history().len(), 2);
    assert!(state.error_history()[0].contains("round 1"));
    assert_eq!(state.validations.len(), 3);
    assert_eq!(validator.calls(), 3);

    let requests = generator.change_requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].previous_transcript.is_none());
    assert_eq!(requests[0].attempt, 1);
    let retry = &requests[2];
    assert_eq!(retry.attempt, 3);
    assert!(
        retry
            .previous_transcript
            .as_deref()
            .is_some_and(|t| t.contains("round 2"))
    );
    assert_eq!(retry.error_history.len(), 2);
}

/// Verifies exit codes [1, 1, 1] fail with the budget exhausted.
#[test]
fn three_failures_exhaust_the_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(
        Ok(plan_for(&["app.py"])),
        vec![fixed_payload(), fixed_payload(), fixed_payload()],
    );
    let validator = ScriptedValidator::new(vec![test_failure(1), test_failure(2), test_failure(3)]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Failed);
    assert_eq!(state.attempt_count(), 3);
    assert_eq!(state.error_history().len(), 3);
    assert_eq!(state.last_error(), Some(MAX_RETRIES_EXCEEDED));
    assert_eq!(state.last_exit_code, Some(1));
    assert!(state.fatal_error.is_none());
    assert!(state.result_url.is_none());
    assert!(publisher.requests().is_empty());
    assert!(!scm.calls().iter().any(|c| c.starts_with("push")));
}

/// Verifies a truncated payload still applies what pattern extraction recovers.
#[test]
fn truncated_payload_applies_recovered_changes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let truncated = r#"```json
{"changes": [{"file_path": "app.py", "action": "modify", "content": "def greet():\n    return 'hello'\n", "description": "fix"}, {"file_path": "other.py", "act"#;
    let generator = ScriptedGenerator::new(
        Ok(plan_for(&["app.py"])),
        vec![Ok(truncated.to_string())],
    );
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Completed);
    let workspace = temp.path().join("demo-run-1");
    assert_eq!(fs::read_to_string(workspace.join("app.py")).expect("read"), FIXED);

    let meta = fs::read_to_string(temp.path().join(".autodev/runs/run-1/attempt-1/meta.json"))
        .expect("meta");
    let meta: serde_json::Value = serde_json::from_str(&meta).expect("json");
    assert_ne!(meta["parse_method"], "strict");
}

/// Verifies an unextractable payload is a failed attempt, never a crash.
#[test]
fn ungenerateable_payload_consumes_an_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(
        Ok(plan_for(&["app.py"])),
        vec![Ok("I am unable to produce that change.".to_string()), fixed_payload()],
    );
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.attempt_count(), 1);
    assert_eq!(state.error_history().len(), 1);
    assert_eq!(validator.calls(), 1);
    assert!(state.validations[0].transcript.contains("=== CHANGE SET ERROR ==="));
    assert_eq!(state.validations[0].exit_code, 1);

    let retry = &generator.change_requests()[1];
    assert!(
        retry
            .previous_transcript
            .as_deref()
            .is_some_and(|t| t.contains("CHANGE SET ERROR"))
    );
}

#[test]
fn generator_errors_are_retried_attempts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(
        Ok(plan_for(&["app.py"])),
        vec![Err("rate limited".to_string())],
    );
    let validator = ScriptedValidator::new(Vec::new());
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 1), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Failed);
    assert_eq!(state.attempt_count(), 1);
    assert_eq!(state.error_history(), [MAX_RETRIES_EXCEEDED.to_string()]);
    assert!(state.last_transcript.contains("rate limited"));
    assert_eq!(validator.calls(), 0);
}

#[test]
fn clone_failure_is_fatal_without_consuming_attempts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), Vec::new());
    let validator = ScriptedValidator::new(Vec::new());
    let scm = FakeSourceControl::new(SEED).failing_clone();
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Failed);
    assert_eq!(state.attempt_count(), 0);
    assert!(state.error_history().is_empty());
    assert!(
        state
            .fatal_error
            .as_deref()
            .is_some_and(|e| e.contains("clone failed"))
    );
    assert!(state.workspace().is_none());
    assert!(generator.plan_requests().is_empty());
}

#[test]
fn push_failure_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), vec![fixed_payload()]);
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED).failing_push();
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Failed);
    assert_eq!(state.attempt_count(), 0);
    assert!(
        state
            .fatal_error
            .as_deref()
            .is_some_and(|e| e.contains("push failed"))
    );
    assert!(publisher.requests().is_empty());
}

#[test]
fn pull_request_failure_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), vec![fixed_payload()]);
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::failing("Validation Failed");

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Failed);
    assert!(
        state
            .fatal_error
            .as_deref()
            .is_some_and(|e| e.contains("Validation Failed"))
    );
}

#[test]
fn nothing_to_commit_still_publishes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), vec![fixed_payload()]);
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED).with_nothing_to_commit();
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(publisher.requests().len(), 1);
}

#[test]
fn validator_error_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), vec![fixed_payload()]);
    let validator = ScriptedValidator::new(vec![Err("workspace vanished".to_string())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Failed);
    assert_eq!(state.attempt_count(), 0);
    assert!(
        state
            .fatal_error
            .as_deref()
            .is_some_and(|e| e.contains("workspace vanished"))
    );
}

#[test]
fn degraded_validation_still_publishes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), vec![fixed_payload()]);
    let degraded = ValidationReport {
        transcript: "=== VALIDATION SKIPPED ===\nsandbox unavailable: no daemon\n".to_string(),
        exit_code: 0,
        degraded: true,
        steps: Vec::new(),
    };
    let validator = ScriptedValidator::new(vec![Ok(degraded)]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Completed);
    assert!(state.validations[0].degraded);
}

#[test]
fn failed_planning_falls_back_to_source_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Err("model offline".to_string()), vec![fixed_payload()]);
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    assert_eq!(state.status(), RunStatus::Completed);
    assert!(state.relevant_files.contains(&"app.py".to_string()));
    assert!(!state.relevant_files.contains(&"README.md".to_string()));
    assert!(!state.plan.is_empty());

    let plan_request = &generator.plan_requests()[0];
    assert!(plan_request.key_files.iter().any(|(path, _)| path == "README.md"));
    assert!(plan_request.tree.iter().any(|line| line.contains("tests/test_app.py")));
    let change_request = &generator.change_requests()[0];
    assert!(change_request.files.iter().any(|(path, _)| path == "app.py"));
}

#[test]
fn existing_workspace_is_reused_without_cloning() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = temp.path().join("prepared");
    fs::create_dir_all(&workspace).expect("mkdir");
    fs::write(workspace.join("app.py"), "def greet():\n    return 'hi'\n").expect("write");

    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), vec![fixed_payload()]);
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let mut initial = state();
    initial.set_workspace(&workspace).expect("workspace");
    let state = Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(initial)
        .expect("run");

    assert_eq!(state.status(), RunStatus::Completed);
    assert!(!scm.calls().iter().any(|c| c.starts_with("clone")));
    assert_eq!(fs::read_to_string(workspace.join("app.py")).expect("read"), FIXED);
}

#[test]
fn started_runs_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(Ok(plan_for(&["app.py"])), vec![fixed_payload()]);
    let validator = ScriptedValidator::new(vec![Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    let mut pipeline =
        Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher);
    let finished = pipeline.run(state()).expect("run");
    let err = pipeline.run(finished).expect_err("already finished");
    assert!(err.to_string().contains("already started"));
}

#[test]
fn run_log_records_each_attempt_and_summary() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(
        Ok(plan_for(&["app.py"])),
        vec![fixed_payload(), fixed_payload()],
    );
    let validator = ScriptedValidator::new(vec![test_failure(1), Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();

    Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .run(state())
        .expect("run");

    let run_dir = temp.path().join(".autodev/runs/run-1");
    let first: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(run_dir.join("attempt-1/meta.json")).expect("meta 1"),
    )
    .expect("json");
    assert_eq!(first["decision"], "retry");
    assert_eq!(first["exit_code"], 1);
    assert!(
        fs::read_to_string(run_dir.join("attempt-1/transcript.log"))
            .expect("transcript")
            .contains("round 1")
    );
    let second: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(run_dir.join("attempt-2/meta.json")).expect("meta 2"),
    )
    .expect("json");
    assert_eq!(second["decision"], "publish");

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("summary.json")).expect("summary"))
            .expect("json");
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["attempt_count"], 1);
}

#[test]
fn job_status_mirrors_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::new(
        Ok(plan_for(&["app.py"])),
        vec![fixed_payload(), fixed_payload()],
    );
    let validator = ScriptedValidator::new(vec![test_failure(1), Ok(passing_report())]);
    let scm = FakeSourceControl::new(SEED);
    let publisher = RecordingPublisher::new();
    let (writer, reader) = JobStatus::start();

    Pipeline::new(config(temp.path(), 3), &generator, &validator, &scm, &publisher)
        .with_status(writer)
        .with_run_log(false)
        .run(state())
        .expect("run");

    let snapshot = reader.snapshot();
    assert!(!snapshot.running);
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(snapshot.result_url.as_deref(), Some(FAKE_PR_URL));
    assert!(snapshot.logs.iter().any(|l| l.starts_with("Attempt 1/3")));
    assert!(snapshot.logs.iter().any(|l| l.starts_with("Attempt 2/3")));
    assert!(snapshot.logs.iter().any(|l| l.starts_with("Validation failed")));
    assert!(snapshot.logs.iter().any(|l| l.starts_with("Run completed")));
    assert!(!temp.path().join(".autodev").exists());
}
