//! Command runner tests that need a real process tree

use std::time::{Duration, Instant};

use dropletd::deploy::context::ExecutionContext;
use dropletd::deploy::runner::{CommandRunner, CommandSpec};
use dropletd::errors::DeployError;

/// Whether `pid` is gone or only waiting to be reaped
fn is_dead(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

async fn wait_for_pid(pidfile: &std::path::Path) -> String {
    for _ in 0..100 {
        if let Ok(pid) = std::fs::read_to_string(pidfile) {
            if !pid.trim().is_empty() {
                return pid.trim().to_string();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("child never wrote its pid");
}

#[tokio::test]
async fn test_timeout_kills_whole_process_group() {
    let tmp = tempfile::tempdir().unwrap();
    let pidfile = tmp.path().join("grandchild.pid");
    let ctx = ExecutionContext::detached("acme");
    let spec = CommandSpec::shell(format!("sleep 30 & echo $! > {}; wait", pidfile.display()))
        .timeout(Duration::from_millis(800));

    let started = Instant::now();
    let err = CommandRunner::with_grace(Duration::from_millis(300))
        .run(&ctx, &spec)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Timeout { .. }), "{}", err);
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid = wait_for_pid(&pidfile).await;
    let mut dead = false;
    for _ in 0..100 {
        if is_dead(&pid) {
            dead = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dead, "grandchild {} survived the timeout", pid);
}

#[tokio::test]
async fn test_cancel_kills_whole_process_group() {
    let tmp = tempfile::tempdir().unwrap();
    let pidfile = tmp.path().join("grandchild.pid");
    let ctx = ExecutionContext::detached("acme");
    let token = ctx.cancel_token().clone();
    let spec = CommandSpec::shell(format!("sleep 30 & echo $! > {}; wait", pidfile.display()));

    let watched = pidfile.clone();
    tokio::spawn(async move {
        wait_for_pid(&watched).await;
        token.cancel();
    });

    let err = CommandRunner::with_grace(Duration::from_millis(300))
        .run(&ctx, &spec)
        .await
        .unwrap_err();
    assert!(err.is_canceled());

    let pid = wait_for_pid(&pidfile).await;
    let mut dead = false;
    for _ in 0..100 {
        if is_dead(&pid) {
            dead = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dead, "grandchild {} survived cancellation", pid);
}

#[tokio::test]
async fn test_stderr_is_part_of_transcript() {
    let ctx = ExecutionContext::detached("acme");
    CommandRunner::new()
        .run(&ctx, &CommandSpec::shell("echo out; echo err >&2"))
        .await
        .unwrap();

    let lines = ctx.lines();
    assert!(lines.contains(&"    out".to_string()));
    assert!(lines.contains(&"    err".to_string()));
}
