//! Hang escalation tests
//!
//! A service thread that outlives the join timeout kills the whole process,
//! so these tests re-run this binary as a child, with only one ignored
//! `child_*` test selected, and watch how the child ends.

use anyhow::{Context, Result};
use fuse_harness::session::DriverOptions;
use fuse_harness::testing::{Script, ScriptedControl};
use fuse_harness_e2e::*;
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Set in the child's environment so its ignored test actually runs
const CHILD_ENV: &str = "FUSE_HARNESS_ESCALATION_CHILD";

const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Slack on top of the join timeout for process startup and polling
const EPSILON: Duration = Duration::from_secs(10);

fn child_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.teardown.join_timeout = JOIN_TIMEOUT;
    config.teardown.events_close_timeout = Duration::from_secs(1);
    // Nothing is mounted through the kernel here
    config.unmount.command = "true".to_string();
    config.unmount.args = Vec::new();
    config.store.env_var = "HARNESS_ESCALATION_STORE".to_string();
    config
}

fn is_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

fn run_child_teardown(script: Script) -> Result<()> {
    let mut fixture = TestFixture::setup(FixtureOptions {
        config: Some(child_config()),
        ..FixtureOptions::default()
    })?;
    fixture.make_mount_with(ScriptedControl::new(script), DriverOptions::default(), two_file_root)?;
    let report = fixture.teardown();
    assert!(report.is_clean(), "{:?}", report.warnings);
    Ok(())
}

/// Run one `child_*` test of this binary in a fresh process
fn spawn_child(test_name: &str) -> Result<(ExitStatus, Duration)> {
    let exe = std::env::current_exe().context("Failed to locate test binary")?;
    let started = Instant::now();
    let mut child = Command::new(exe)
        .args([test_name, "--exact", "--ignored", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .context("Failed to spawn child test process")?;

    let deadline = started + JOIN_TIMEOUT + EPSILON;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, started.elapsed()));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("child {} still running after {:?}", test_name, deadline - started);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

// =============================================================================
// Child bodies (run only inside the re-executed binary)
// =============================================================================

#[test]
#[ignore]
fn child_hung_service_thread() -> Result<()> {
    if !is_child() {
        return Ok(());
    }
    run_child_teardown(Script::Block)?;
    panic!("teardown returned with a hung service thread");
}

#[test]
#[ignore]
fn child_prompt_service_thread() -> Result<()> {
    if !is_child() {
        return Ok(());
    }
    run_child_teardown(Script::ExitAfter(Duration::from_millis(200)))
}

// =============================================================================
// Parent assertions
// =============================================================================

#[test]
fn hung_service_thread_kills_process() -> Result<()> {
    if is_child() {
        return Ok(());
    }

    let (status, elapsed) = spawn_child("child_hung_service_thread")?;

    assert_eq!(
        status.signal(),
        Some(Signal::SIGKILL as i32),
        "child should die of SIGKILL, got {:?}",
        status
    );
    assert!(
        elapsed >= JOIN_TIMEOUT,
        "killed after {:?}, before the join timeout",
        elapsed
    );
    Ok(())
}

#[test]
fn prompt_service_thread_is_not_killed() -> Result<()> {
    if is_child() {
        return Ok(());
    }

    let (status, _) = spawn_child("child_prompt_service_thread")?;

    assert!(status.success(), "child failed: {:?}", status);
    assert_eq!(status.signal(), None);
    Ok(())
}
