//! Validation Runner: syntax check, test suite, then advisory lint, all in
//! the sandbox, folded into one transcript and one exit code.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::{StepRecord, ValidationReport};
use crate::io::config::{UnavailablePolicy, ValidationConfig};
use crate::io::sandbox::{ExecutionResult, Sandbox, SandboxError, SandboxRequest};

pub trait Validator {
    /// Validate the workspace. `Err` means infrastructure failure, not a
    /// failing check.
    fn validate(&self, workdir: &Path) -> Result<ValidationReport>;
}

impl<T: Validator + ?Sized> Validator for &T {
    fn validate(&self, workdir: &Path) -> Result<ValidationReport> {
        (**self).validate(workdir)
    }
}

/// How a step's result feeds the overall exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Never affects the exit code.
    Advisory,
    /// Any failure forces exit code 1.
    Syntax,
    /// Exit code becomes the overall code if nothing failed before.
    Tests,
}

struct Step<'a> {
    name: &'static str,
    header: &'static str,
    command: &'a str,
    gate: Gate,
}

pub struct SandboxValidator<S> {
    sandbox: S,
    config: ValidationConfig,
    timeout: Duration,
}

impl<S: Sandbox> SandboxValidator<S> {
    pub fn new(sandbox: S, config: ValidationConfig, timeout: Duration) -> Self {
        Self {
            sandbox,
            config,
            timeout,
        }
    }

    fn steps(&self) -> Vec<Step<'_>> {
        let mut steps = Vec::new();
        if let Some(setup) = self.config.setup.as_deref().filter(|s| !s.trim().is_empty()) {
            steps.push(Step {
                name: "setup",
                header: "=== SETUP ===",
                command: setup,
                gate: Gate::Advisory,
            });
        }
        steps.push(Step {
            name: "syntax",
            header: "=== SYNTAX CHECK ===",
            command: &self.config.syntax,
            gate: Gate::Syntax,
        });
        steps.push(Step {
            name: "tests",
            header: "=== TESTS ===",
            command: &self.config.tests,
            gate: Gate::Tests,
        });
        steps.push(Step {
            name: "lint",
            header: "=== LINT ===",
            command: &self.config.lint,
            gate: Gate::Advisory,
        });
        steps
    }

    /// Report for a sandbox that went away. Steps that already ran stay in
    /// the transcript ahead of the skip notice.
    fn degraded(
        &self,
        reason: &str,
        mut transcript: String,
        steps: Vec<StepRecord>,
    ) -> ValidationReport {
        let exit_code = match self.config.on_sandbox_unavailable {
            UnavailablePolicy::Pass => 0,
            UnavailablePolicy::Fail => 1,
        };
        warn!(reason, exit_code, completed_steps = steps.len(), "sandbox unavailable, validation degraded");
        transcript.push_str("=== VALIDATION SKIPPED ===\n");
        transcript.push_str(&format!("sandbox unavailable: {reason}\n"));
        if steps.is_empty() {
            transcript.push_str("no checks were run\n");
        } else {
            transcript.push_str("remaining checks were not run\n");
        }
        ValidationReport {
            transcript,
            exit_code,
            degraded: true,
            steps,
        }
    }
}

impl<S: Sandbox> Validator for SandboxValidator<S> {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn validate(&self, workdir: &Path) -> Result<ValidationReport> {
        if !workdir.is_dir() {
            return Err(anyhow!("workspace {} does not exist", workdir.display()));
        }

        let mut transcript = String::new();
        let mut records = Vec::new();
        let mut exit_code = 0;

        for step in self.steps() {
            let request = SandboxRequest::new(step.command, workdir, self.timeout);
            let result = match self.sandbox.execute(&request) {
                Ok(result) => result,
                Err(SandboxError::Unavailable(reason)) => {
                    return Ok(self.degraded(&reason, transcript, records));
                }
                Err(err) => {
                    warn!(step = step.name, err = %err, "sandbox step failed");
                    transcript.push_str("=== EXECUTION ERROR ===\n");
                    transcript.push_str(&format!("{} step could not run: {err}\n", step.name));
                    if exit_code == 0 {
                        exit_code = 1;
                    }
                    break;
                }
            };

            append_section(&mut transcript, step.header, &result);
            records.push(StepRecord {
                name: step.name.to_string(),
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                duration_secs: result.duration_secs,
            });

            match step.gate {
                Gate::Advisory => {}
                Gate::Syntax => {
                    if !result.success() {
                        exit_code = 1;
                    }
                }
                Gate::Tests => {
                    if exit_code == 0 && !result.success() {
                        exit_code = if result.exit_code == 0 { 1 } else { result.exit_code };
                    }
                }
            }
        }

        info!(exit_code, steps = records.len(), "validation finished");
        Ok(ValidationReport {
            transcript,
            exit_code,
            degraded: false,
            steps: records,
        })
    }
}

fn append_section(transcript: &mut String, header: &str, result: &ExecutionResult) {
    transcript.push_str(header);
    transcript.push('\n');
    transcript.push_str(&format!(
        "exit code: {} ({:.2}s)\n",
        result.exit_code, result.duration_secs
    ));
    if !result.stdout.trim().is_empty() {
        transcript.push_str(result.stdout.trim_end());
        transcript.push('\n');
    }
    if !result.stderr.trim().is_empty() {
        transcript.push_str(result.stderr.trim_end());
        transcript.push('\n');
    }
    if result.timed_out {
        transcript.push_str(&format!(
            "[timed out after {:.0}s]\n",
            result.duration_secs
        ));
    }
    transcript.push('\n');
}
