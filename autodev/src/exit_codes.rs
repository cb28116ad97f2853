//! Stable exit codes for autodev CLI commands.

/// Command succeeded; for `run`, a pull request was published.
pub const OK: i32 = 0;
/// Invalid config, missing credentials, unusable sandbox or other errors.
pub const INVALID: i32 = 1;
/// `autodev run` ended in the failed status.
pub const RUN_FAILED: i32 = 2;
/// `autodev validate` or `autodev exec` reported a non-zero exit code.
pub const VALIDATION_FAILED: i32 = 3;
