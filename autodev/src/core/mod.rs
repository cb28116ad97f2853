//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod changeset;
pub mod decision;
pub mod diagnostics;
pub mod invariants;
pub mod path;
pub mod plan;
pub mod pull_request;
pub mod run_state;
pub mod transition;
pub mod types;
