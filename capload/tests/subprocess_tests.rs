//! Tests for subprocess lifecycle management
//!
//! This module tests:
//! - Request multiplexing: out-of-order responses reach their callers
//! - Spawn coalescing: concurrent callers share one spawn
//! - Crash detection and restart, with other processes untouched
//! - Idle reclamation by the background reaper
//! - Per-request timeouts
//!
//! Fixture tool servers are small `sh` scripts speaking line-framed JSON-RPC
//! on stdio. Request ids are sequential per process starting at 1 (the
//! initialize handshake takes id 1), which lets fixtures reply
//! deterministically.

#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use capload::binaries::BinaryResolver;
use capload::config::LoaderConfig;
use capload::error::LoaderError;
use capload::subprocess::StdioProcessManager;
use capload::types::{DependencyKind, McpDependency};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

// =============================================================================
// Test Fixtures
// =============================================================================

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Answers every request with an echo of the full request line.
const ECHO_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true,"echo":%s}}\n' "$id" "$line"
  fi
done
"#;

/// Handshakes, then buffers three requests and answers them in reverse order.
const REORDER_SERVER: &str = r#"#!/bin/sh
IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
IFS= read -r notif
IFS= read -r a
IFS= read -r b
IFS= read -r c
for line in "$c" "$b" "$a"; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":%s}}\n' "$id" "$line"
done
cat >/dev/null
"#;

/// Sleeps before completing the handshake so concurrent spawns can race.
const SLOW_INIT_SERVER: &str = r#"#!/bin/sh
IFS= read -r line
sleep 1
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
IFS= read -r notif
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
  fi
done
"#;

/// Handshakes and then never answers any request.
const SILENT_SERVER: &str = r#"#!/bin/sh
IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
IFS= read -r notif
cat >/dev/null
"#;

/// Handshakes, swallows three requests without answering, then exits so all
/// three are still pending when the stream closes.
const SINK_THEN_EXIT_SERVER: &str = r#"#!/bin/sh
IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
IFS= read -r notif
IFS= read -r a
IFS= read -r b
IFS= read -r c
exit 0
"#;

/// Answers the handshake immediately but sleeps before every later response,
/// keeping its callers' requests in flight for a while.
const DELAYED_ECHO_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    if [ "$id" != "1" ]; then sleep 1; fi
    printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
  fi
done
"#;

/// Exits after answering one request on its first run (marker file absent),
/// then behaves as a well-mannered echo server on every later run.
fn crash_once_server(marker: &Path) -> String {
    format!(
        r#"#!/bin/sh
IFS= read -r line
printf '{{"jsonrpc":"2.0","id":1,"result":{{}}}}\n'
IFS= read -r notif
if [ ! -f {marker} ]; then
  touch {marker}
  IFS= read -r line
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{{"jsonrpc":"2.0","id":%s,"result":{{"phase":"first"}}}}\n' "$id"
  exit 0
fi
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{{"jsonrpc":"2.0","id":%s,"result":{{"phase":"restarted"}}}}\n' "$id"
  fi
done
"#,
        marker = marker.display()
    )
}

fn test_config(dir: &TempDir) -> LoaderConfig {
    LoaderConfig {
        state_dir: dir.path().join("state"),
        binary_cache_dir: dir.path().join("binaries"),
        request_timeout_ms: 5_000,
        handshake_timeout_ms: 5_000,
        restart_initial_delay_ms: 10,
        restart_max_delay_ms: 100,
        ..Default::default()
    }
}

fn test_manager(config: &LoaderConfig) -> Arc<StdioProcessManager> {
    // RUST_LOG=debug surfaces the manager's spawn/restart/reap decisions.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    StdioProcessManager::new(config, Arc::new(BinaryResolver::new(config)))
}

fn script_dep(name: &str, script: &Path) -> McpDependency {
    McpDependency {
        name: name.to_string(),
        kind: DependencyKind::Subprocess,
        install_command: format!("npm install -g {}", name),
        version: "1.0.0".to_string(),
        digest: "sha256-test".to_string(),
        env_vars: vec![],
        command: Some(script.to_string_lossy().into_owned()),
        args: vec![],
        env_overrides: HashMap::new(),
    }
}

// =============================================================================
// Multiplexing
// =============================================================================

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "reorder.sh", REORDER_SERVER);
    let manager = test_manager(&test_config(&dir));
    let dep = script_dep("reorder", &script);

    let (r1, r2, r3) = tokio::join!(
        manager.call_tool(&dep, "lookup", json!({"marker": "one"})),
        manager.call_tool(&dep, "lookup", json!({"marker": "two"})),
        manager.call_tool(&dep, "lookup", json!({"marker": "three"})),
    );

    // The fixture answers in reverse arrival order; each caller must still
    // receive the response carrying its own marker.
    assert_eq!(r1.unwrap()["echo"]["params"]["arguments"]["marker"], "one");
    assert_eq!(r2.unwrap()["echo"]["params"]["arguments"]["marker"], "two");
    assert_eq!(r3.unwrap()["echo"]["params"]["arguments"]["marker"], "three");
    assert_eq!(manager.spawn_count(), 1);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_spawn() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "slow_init.sh", SLOW_INIT_SERVER);
    let manager = test_manager(&test_config(&dir));
    let dep = script_dep("slow", &script);

    // Both callers arrive while the handshake is still sleeping; the second
    // must wait on the first caller's spawn instead of starting its own.
    let (a, b) = tokio::join!(
        manager.call_tool(&dep, "ping", json!({})),
        manager.call_tool(&dep, "ping", json!({})),
    );
    assert_eq!(a.unwrap()["ok"], true);
    assert_eq!(b.unwrap()["ok"], true);
    assert_eq!(manager.spawn_count(), 1);

    manager.shutdown_all().await;
}

// =============================================================================
// Crash handling
// =============================================================================

#[tokio::test]
async fn test_crash_triggers_restart_with_fresh_process() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("crashed.marker");
    let script = write_script(dir.path(), "flaky.sh", &crash_once_server(&marker));
    let manager = test_manager(&test_config(&dir));
    let dep = script_dep("flaky", &script);

    let first = manager.call_tool(&dep, "work", json!({})).await.unwrap();
    assert_eq!(first["phase"], "first");
    let pid_before = manager.pid_of("flaky").await;

    // The fixture exits right after answering; give the crash handler time
    // to notice the EOF and restart.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let second = manager.call_tool(&dep, "work", json!({})).await.unwrap();
    assert_eq!(second["phase"], "restarted");
    let pid_after = manager.pid_of("flaky").await;
    assert!(pid_after.is_some());
    assert_ne!(pid_before, pid_after);
    assert!(manager.spawn_count() >= 2);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_crash_of_one_process_leaves_others_untouched() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("crashed.marker");
    let flaky_script = write_script(dir.path(), "flaky.sh", &crash_once_server(&marker));
    let echo_script = write_script(dir.path(), "echo.sh", ECHO_SERVER);
    let manager = test_manager(&test_config(&dir));
    let flaky = script_dep("flaky", &flaky_script);
    let stable = script_dep("stable", &echo_script);

    manager.call_tool(&stable, "ping", json!({})).await.unwrap();
    let stable_pid = manager.pid_of("stable").await.unwrap();

    manager.call_tool(&flaky, "work", json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The stable process kept its pid and still answers.
    assert_eq!(manager.pid_of("stable").await, Some(stable_pid));
    let again = manager.call_tool(&stable, "ping", json!({})).await.unwrap();
    assert_eq!(again["ok"], true);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_crash_rejects_inflight_requests_but_not_other_processes() {
    let dir = TempDir::new().unwrap();
    let doomed_script = write_script(dir.path(), "doomed.sh", SINK_THEN_EXIT_SERVER);
    let slow_script = write_script(dir.path(), "slow_echo.sh", DELAYED_ECHO_SERVER);
    let manager = test_manager(&test_config(&dir));
    let doomed = script_dep("doomed", &doomed_script);
    let stable = script_dep("stable", &slow_script);

    // The doomed fixture exits only after all three requests have reached it,
    // so all three callers are parked on pending entries at stream closure.
    // The stable process has its own request in flight throughout.
    let (s, d1, d2, d3) = tokio::join!(
        manager.call_tool(&stable, "slow", json!({})),
        manager.call_tool(&doomed, "a", json!({})),
        manager.call_tool(&doomed, "b", json!({})),
        manager.call_tool(&doomed, "c", json!({})),
    );

    // Every parked caller on the dead process is rejected, none left hanging
    // until its timeout.
    for result in [d1, d2, d3] {
        let err = result.unwrap_err();
        assert!(matches!(err, LoaderError::Terminated(_)), "got {:?}", err);
    }

    // The crash never touches the other process's pending request.
    assert_eq!(s.unwrap()["ok"], true);

    manager.shutdown_all().await;
}

// =============================================================================
// Idle reclamation
// =============================================================================

#[tokio::test]
async fn test_idle_processes_are_reclaimed_and_respawned_on_demand() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "echo.sh", ECHO_SERVER);
    let config = LoaderConfig {
        idle_timeout_ms: 200,
        reap_interval_ms: 50,
        ..test_config(&dir)
    };
    let manager = test_manager(&config);
    let dep = script_dep("echo", &script);

    manager.call_tool(&dep, "ping", json!({})).await.unwrap();
    assert!(manager.pid_of("echo").await.is_some());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(manager.pid_of("echo").await.is_none());

    // The next call spawns fresh.
    let out = manager.call_tool(&dep, "ping", json!({})).await.unwrap();
    assert_eq!(out["ok"], true);
    assert_eq!(manager.spawn_count(), 2);

    manager.shutdown_all().await;
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "silent.sh", SILENT_SERVER);
    let config = LoaderConfig {
        request_timeout_ms: 200,
        ..test_config(&dir)
    };
    let manager = test_manager(&config);
    let dep = script_dep("silent", &script);

    let err = manager.call_tool(&dep, "ping", json!({})).await.unwrap_err();
    assert!(matches!(err, LoaderError::Timeout(_)), "got {:?}", err);

    manager.shutdown_all().await;
}
