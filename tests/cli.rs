//! Integration tests for the CLI surface, run against the built binary
//! directly (the crate has no lib target, only `[[bin]]`). These only
//! exercise argument parsing and the pre-perf_event_open config
//! validation path, since opening perf events needs root or
//! `CAP_PERFMON` and can't be assumed in a test environment.

use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_sprofd"))
}

#[test]
fn help_flag_prints_usage_and_exits_zero() {
    let output = bin().arg("--help").output().expect("failed to run sprofd");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sprofd"));
}

#[test]
fn missing_endpoint_exits_nonzero_without_touching_perf_event_open() {
    // No --agent-url, no DD_TRACE_AGENT_URL/DD_AGENT_HOST/DD_API_KEY in the
    // environment this test controls: ContextBuilder::build should reject
    // the configuration before main ever opens a perf fd.
    let output = bin()
        .env_remove("DD_TRACE_AGENT_URL")
        .env_remove("DD_AGENT_HOST")
        .env_remove("DD_API_KEY")
        .env_remove("DD_PROFILING_NATIVE_LIBRARY_ACTIVE")
        .output()
        .expect("failed to run sprofd");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no agent URL") || stderr.contains("nowhere to send profiles"));
}

#[test]
fn reentrancy_guard_refuses_a_second_instance() {
    let output = bin()
        .env("DD_PROFILING_NATIVE_LIBRARY_ACTIVE", "1")
        .env("DD_AGENT_HOST", "localhost")
        .output()
        .expect("failed to run sprofd");
    assert!(output.status.success());
}
