//! Decision Router: pure routing from a validation outcome to the next stage.

use serde::{Deserialize, Serialize};

use crate::core::diagnostics::extract_error_summary;
use crate::core::types::RunStatus;

/// Error entry recorded when the attempt budget runs out.
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextStage {
    Publish,
    Retry,
    Fail,
}

impl NextStage {
    /// Status the run moves to when this decision is taken.
    pub fn status(&self) -> RunStatus {
        match self {
            NextStage::Publish => RunStatus::Publishing,
            NextStage::Retry => RunStatus::Applying,
            NextStage::Fail => RunStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NextStage::Publish => "publish",
            NextStage::Retry => "retry",
            NextStage::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub next: NextStage,
    /// Attempt count after this decision.
    pub attempt_count: u32,
    /// Entry to append to the error history, if any.
    pub error_entry: Option<String>,
}

/// Route a validation outcome.
///
/// - exit code `0`: publish, attempt count unchanged.
/// - failure with `attempt_count < max_attempts - 1`: retry, one more attempt
///   consumed, the transcript's error summary recorded.
/// - otherwise: fail, one more attempt consumed, [`MAX_RETRIES_EXCEEDED`] recorded.
///
/// Deterministic in its inputs.
pub fn decide(exit_code: i32, transcript: &str, attempt_count: u32, max_attempts: u32) -> Decision {
    if exit_code == 0 {
        return Decision {
            next: NextStage::Publish,
            attempt_count,
            error_entry: None,
        };
    }
    let consumed = attempt_count.saturating_add(1);
    if attempt_count < max_attempts.saturating_sub(1) {
        Decision {
            next: NextStage::Retry,
            attempt_count: consumed,
            error_entry: Some(extract_error_summary(transcript)),
        }
    } else {
        Decision {
            next: NextStage::Fail,
            attempt_count: consumed,
            error_entry: Some(MAX_RETRIES_EXCEEDED.to_string()),
        }
    }
}
