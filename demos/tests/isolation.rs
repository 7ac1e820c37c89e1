//! Every executor outcome, produced by real worker processes of the
//! `failure_modes` binary.

use isoload::{DeliveryConfig, ExecutionError, FailureKind, Isolate, IsolatedExecutor, WorkerConfig};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

const WORKER: &str = env!("CARGO_BIN_EXE_failure_modes");
const TIMEOUT: Duration = Duration::from_secs(30);
const GRACE: Duration = Duration::from_millis(500);

fn executor(cache: &Path) -> IsolatedExecutor {
    let config = WorkerConfig {
        delivery: DeliveryConfig {
            cache_path: cache.to_path_buf(),
            ..DeliveryConfig::default()
        },
        ..WorkerConfig::default()
    };
    IsolatedExecutor::new(config)
        .with_worker_binary(WORKER)
        .with_grace_period(GRACE)
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
fn successful_operation_returns_spec_keys_and_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let payload = executor(dir.path()).execute("quick_local_query", TIMEOUT).unwrap();

    assert!(payload.success);
    assert_eq!(payload.summary_keys, ["Sample"]);
    let delivered = payload.delivered_map();
    assert!(delivered["local"][0].ends_with("Cargo.toml"));
}

#[test]
fn captured_output_travels_with_the_payload() {
    let dir = tempfile::tempdir().unwrap();
    let payload = executor(dir.path()).execute("chatty", TIMEOUT).unwrap();

    assert!(payload.stdout.contains("chatty: building query"));
    assert!(payload.stderr.contains("chatty: warning from the query client"));
}

#[test]
fn large_payload_does_not_stall_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let payload = executor(dir.path()).execute("large_output", TIMEOUT).unwrap();
    assert_eq!(payload.delivered_map()["large"].len(), 20_000);
}

#[test]
fn operation_error_carries_message_and_traceback() {
    let dir = tempfile::tempdir().unwrap();
    let err = executor(dir.path()).execute("raises_error", TIMEOUT).unwrap_err();

    let payload = err.payload().expect("error payload");
    assert!(!payload.success);
    assert_eq!(payload.kind, FailureKind::OperationError);
    assert_eq!(payload.error, "query construction failed");
    assert!(payload.traceback.contains("transform request rejected"));
}

#[test]
fn panic_is_reported_with_backtrace() {
    let dir = tempfile::tempdir().unwrap();
    let err = executor(dir.path()).execute("panics", TIMEOUT).unwrap_err();

    let payload = err.payload().expect("error payload");
    assert_eq!(payload.kind, FailureKind::Panic);
    assert_eq!(payload.error, "query client panicked");
    assert!(!payload.traceback.is_empty());
}

#[test]
fn invalid_spec_and_delivery_failures_are_distinguished() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path());

    let invalid = executor.execute("invalid_spec", TIMEOUT).unwrap_err();
    assert_eq!(invalid.payload().map(|p| p.kind), Some(FailureKind::InvalidSpec));

    let missing = executor.execute("missing_file", TIMEOUT).unwrap_err();
    let payload = missing.payload().expect("error payload");
    assert_eq!(payload.kind, FailureKind::DeliveryError);
    assert!(payload.error.contains("missing.root"));
}

#[test]
fn unknown_operation_is_reported_by_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let err = executor(dir.path()).execute("no_such_operation", TIMEOUT).unwrap_err();
    assert_eq!(err.payload().map(|p| p.kind), Some(FailureKind::UnknownOperation));
}

#[test]
fn clean_exit_without_payload_is_not_a_success() {
    let dir = tempfile::tempdir().unwrap();
    let err = executor(dir.path()).execute("exits_without_payload", TIMEOUT).unwrap_err();
    assert!(matches!(err, ExecutionError::MissingPayload { .. }), "{err:?}");
}

#[test]
fn nonzero_exit_without_payload_reports_the_code() {
    let dir = tempfile::tempdir().unwrap();
    let err = executor(dir.path()).execute("exits_with_code", TIMEOUT).unwrap_err();
    assert!(matches!(err, ExecutionError::NonzeroExit { code: 7, .. }), "{err:?}");
}

#[test]
fn hanging_worker_is_terminated_at_the_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let timeout = Duration::from_secs(1);
    let start = Instant::now();
    let err = executor(dir.path()).execute("hangs", timeout).unwrap_err();

    match err {
        ExecutionError::Timeout { pid, .. } => assert!(!process_alive(pid)),
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(start.elapsed() < timeout + GRACE + Duration::from_secs(2));
}

#[test]
fn worker_ignoring_sigterm_is_killed_after_the_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let timeout = Duration::from_secs(1);
    let start = Instant::now();
    let err = executor(dir.path()).execute("ignores_sigterm", timeout).unwrap_err();
    let elapsed = start.elapsed();

    match err {
        ExecutionError::Timeout { pid, .. } => assert!(!process_alive(pid)),
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(elapsed >= timeout + GRACE, "killed after {elapsed:?}");
    assert!(elapsed < timeout + GRACE + Duration::from_secs(2), "killed after {elapsed:?}");
}

#[test]
fn concurrent_invocations_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path());

    std::thread::scope(|s| {
        let ok = s.spawn(|| executor.execute("quick_local_query", TIMEOUT));
        let chatty = s.spawn(|| executor.execute("chatty", TIMEOUT));
        let failing = s.spawn(|| executor.execute("raises_error", TIMEOUT));
        let panicking = s.spawn(|| executor.execute("panics", TIMEOUT));

        let ok = ok.join().unwrap().unwrap();
        assert!(ok.delivered_map().contains_key("local"));
        assert!(!ok.stdout.contains("chatty"));

        let chatty = chatty.join().unwrap().unwrap();
        assert!(chatty.stdout.contains("chatty: building query"));

        let failing = failing.join().unwrap().unwrap_err();
        assert_eq!(failing.payload().map(|p| p.kind), Some(FailureKind::OperationError));

        let panicking = panicking.join().unwrap().unwrap_err();
        assert_eq!(panicking.payload().map(|p| p.kind), Some(FailureKind::Panic));
    });
}

fn cli(dir: &Path) -> Command {
    let mut command = Command::new(WORKER);
    command
        .current_dir(dir)
        .env_remove("ISOLOAD_CONFIG")
        .env_remove("RUST_LOG")
        .env("SERVICEX_CACHE_PATH", dir.join("cache"));
    command
}

#[test]
fn cli_exec_prints_the_payload() {
    let dir = tempfile::tempdir().unwrap();
    let output = cli(dir.path())
        .args(["exec", "quick_local_query", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let body: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["summary_keys"][0], "Sample");
    assert!(body["delivered"]["local"][0].as_str().unwrap().ends_with("Cargo.toml"));
}

#[test]
fn cli_exec_failure_exits_nonzero_with_traceback() {
    let dir = tempfile::tempdir().unwrap();
    let output = cli(dir.path())
        .args(["exec", "raises_error", "--format", "json"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let body: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "WorkerException");
    assert!(body["traceback"].as_str().unwrap().contains("transform request rejected"));
}

#[test]
fn cli_list_shows_public_tasks_only() {
    let dir = tempfile::tempdir().unwrap();
    let output = cli(dir.path()).arg("list").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("quick_local_query_task"));
    assert!(stdout.contains("FailureModes"));
    assert!(!stdout.contains("_private_helper"));
}

#[test]
fn cli_run_drives_users_and_writes_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("report.json");
    let output = cli(dir.path())
        .args([
            "run",
            "--users",
            "2",
            "--iterations",
            "1",
            "--run-time",
            "60s",
            "--filter",
            "^quick_local_query$",
            "--format",
            "json",
            "--output",
        ])
        .arg(&report_path)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["users"], 2);
    assert_eq!(report["total_requests"], 2);
    assert_eq!(report["total_failures"], 0);
    assert_eq!(report["tasks"][0]["name"], "quick_local_query_task");
}
