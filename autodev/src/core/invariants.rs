//! Run-state invariants that hold after every coordinator step.

use crate::core::decision::MAX_RETRIES_EXCEEDED;
use crate::core::run_state::RunState;
use crate::core::types::RunStatus;

/// Check the invariants of a run state:
/// - `attempt_count <= max_attempts`
/// - one error-history entry per consumed attempt
/// - a workspace is bound once planning has finished
/// - `completed` carries a result URL
/// - `failed` carries either a fatal error or the budget-exhausted entry
pub fn validate_run_state(state: &RunState, max_attempts: u32) -> Vec<String> {
    let mut errors = Vec::new();
    let attempts = state.attempt_count();

    if attempts > max_attempts {
        errors.push(format!(
            "attempt_count {attempts} exceeds max_attempts {max_attempts}"
        ));
    }

    let entries = state.error_history().len();
    if entries != attempts as usize {
        errors.push(format!(
            "error_history has {entries} entries but attempt_count is {attempts}"
        ));
    }

    let status = state.status();
    let needs_workspace = matches!(
        status,
        RunStatus::Applying | RunStatus::Validating | RunStatus::Publishing | RunStatus::Completed
    );
    if needs_workspace && state.workspace().is_none() {
        errors.push(format!("status {status} without a workspace"));
    }

    if status == RunStatus::Completed && state.result_url.is_none() {
        errors.push("completed run without a result url".to_string());
    }

    if status == RunStatus::Failed
        && state.fatal_error.is_none()
        && state.last_error() != Some(MAX_RETRIES_EXCEEDED)
    {
        errors.push("failed run without a recorded cause".to_string());
    }

    if state.last_exit_code.is_some() && state.validations.is_empty() {
        errors.push("last_exit_code set without a validation record".to_string());
    }

    errors
}
