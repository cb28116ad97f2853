//! Docker sandbox teardown checks.
//!
//! These tests need a running Docker daemon and the default image, so they
//! are excluded from regular runs.
//!
//! Run with: `cargo test --test sandbox_docker -- --ignored`

use std::time::Duration;

use autodev::io::config::SandboxConfig;
use autodev::io::sandbox::{DockerSandbox, Sandbox, SandboxRequest, TIMEOUT_EXIT_CODE};

fn sandbox() -> DockerSandbox {
    DockerSandbox::from_config(&SandboxConfig::default())
}

fn assert_no_containers(sandbox: &DockerSandbox) {
    let remaining = sandbox.list_sandbox_containers().expect("list containers");
    assert!(remaining.is_empty(), "containers left behind: {remaining:?}");
}

#[test]
#[ignore = "requires a Docker daemon"]
fn successful_command_leaves_no_container() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("hello.txt"), "hi").expect("write");
    let sandbox = sandbox();
    let result = sandbox
        .execute(&SandboxRequest::new(
            "cat hello.txt",
            temp.path(),
            Duration::from_secs(60),
        ))
        .expect("execute");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.trim(), "hi");
    assert_no_containers(&sandbox);
}

#[test]
#[ignore = "requires a Docker daemon"]
fn failing_command_leaves_no_container() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sandbox();
    let result = sandbox
        .execute(&SandboxRequest::new("exit 3", temp.path(), Duration::from_secs(60)))
        .expect("execute");
    assert_eq!(result.exit_code, 3);
    assert_no_containers(&sandbox);
}

#[test]
#[ignore = "requires a Docker daemon"]
fn timed_out_command_leaves_no_container() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sandbox();
    let result = sandbox
        .execute(&SandboxRequest::new("sleep 30", temp.path(), Duration::from_secs(2)))
        .expect("execute");
    assert!(result.timed_out);
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_no_containers(&sandbox);
}

#[test]
#[ignore = "requires a Docker daemon"]
fn network_is_disabled_by_default() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sandbox();
    let result = sandbox
        .execute(&SandboxRequest::new(
            "python -c \"import socket; socket.create_connection(('1.1.1.1', 53), 3)\"",
            temp.path(),
            Duration::from_secs(60),
        ))
        .expect("execute");
    assert_ne!(result.exit_code, 0);
    assert_no_containers(&sandbox);
}
