//! Autonomous code-modification pipeline.
//!
//! A run clones a repository, plans a change, asks a generator for file
//! edits, validates them in a sandbox and either retries with the failure
//! transcript, publishes a pull request, or stops after a bounded number of
//! attempts. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (run state, transitions, routing,
//!   change-set recovery). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (sandbox, git, GitHub, generator,
//!   filesystem). Each sits behind a trait so the pipeline can be driven by
//!   test doubles.
//!
//! [`pipeline`] coordinates the two; [`status`] exposes a running job to pollers.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
