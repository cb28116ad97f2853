//! Side-effecting adapters: processes, sandboxes, filesystem, git, HTTP.

pub mod apply;
pub mod config;
pub mod docker;
pub mod files;
pub mod generator;
pub mod git;
pub mod github;
pub mod local;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod sandbox;
pub mod validation;
