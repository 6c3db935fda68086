//! End-to-end lifecycle tests driving real subprocesses through the
//! Executor against a real on-disk database.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use lathe_config::AnalysisHeader;
use lathe_execution::{Executor, ExecutorConfig, TaskInvocation};
use lathe_ipc::{Message, MessageEnvelope, TaskOutcome, TaskStatus};
use lathe_storage::ConfigDatabase;

fn header_in(dir: &TempDir) -> AnalysisHeader {
    AnalysisHeader {
        work_dir: dir.path().to_string_lossy().into_owned(),
        ..AnalysisHeader::default()
    }
}

/// Shell fragment printing one framed message on stdout.
fn framed(message: Message) -> String {
    let envelope = MessageEnvelope::new(message);
    format!(
        "printf '\\036%s\\n' '{}'",
        serde_json::to_string(&envelope).unwrap()
    )
}

fn fast_executor() -> Executor {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Executor::new(ExecutorConfig {
        poll_interval: Duration::from_millis(20),
        grace_period: Duration::from_millis(300),
        socket_dir: None,
    })
}

#[tokio::test]
async fn test_successful_run_is_completed_and_recorded_valid() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    let outcome = TaskOutcome::new("indexed 480 frames", json!({ "hits": 480 }))
        .with_schemas(vec!["peaks-1".to_string()]);
    let script = format!(
        "{}\n{}\nexit 0",
        framed(Message::status("indexing")),
        framed(Message::result(&outcome).unwrap())
    );
    let invocation = TaskInvocation::new("IndexRun", "/bin/sh")
        .args(["-c", script.as_str()])
        .header(header_in(&dir));

    let report = fast_executor().run_to_completion(invocation, &db).await;

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.summary, "indexed 480 frames");
    assert_eq!(report.payload["hits"], json!(480));

    // One row, and its result is immediately readable back as valid
    assert_eq!(db.count_rows("IndexRun").await.unwrap(), 1);
    let status = db.read_latest("IndexRun", "task_status", true).await.unwrap();
    assert_eq!(status, Some(json!("COMPLETED")));
    let schemas = db.read_latest("IndexRun", "impl_schemas", true).await.unwrap();
    assert_eq!(schemas, Some(json!("peaks-1")));
}

#[tokio::test]
async fn test_third_party_stdout_and_stderr_are_captured() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    // Plain binary knowing nothing about framing; exit code decides
    let invocation = TaskInvocation::new("OpaqueTool", "/bin/sh")
        .args(["-c", "echo processing input; echo progress on stderr 1>&2; exit 0"])
        .header(header_in(&dir));

    let report = fast_executor().run_to_completion(invocation, &db).await;

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.payload, json!(null));
    assert_eq!(db.count_rows("OpaqueTool").await.unwrap(), 1);
}

#[tokio::test]
async fn test_failing_tool_records_failed_with_stderr_summary() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    let invocation = TaskInvocation::new("OpaqueTool", "/bin/sh")
        .args(["-c", "echo cannot open detector geometry 1>&2; exit 1"])
        .header(header_in(&dir));

    let report = fast_executor().run_to_completion(invocation, &db).await;

    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.summary.contains("cannot open detector geometry"));
    let valid = db.read_latest("OpaqueTool", "task_status", true).await.unwrap();
    assert_eq!(valid, None, "failed rows must not be valid by default");
}

#[tokio::test]
async fn test_missing_executable_never_enters_running() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    let invocation = TaskInvocation::new("Ghost", "/nonexistent/binary")
        .header(header_in(&dir));

    let report = fast_executor().run_to_completion(invocation, &db).await;

    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.summary.contains("setup failed"));
    // Exactly one row even though the process never spawned
    assert_eq!(db.count_rows("Ghost").await.unwrap(), 1);
}

#[tokio::test]
async fn test_timeout_terminates_and_keeps_partial_result() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    let partial = TaskOutcome::new("112 of 480 frames", json!({ "hits": 112 }));
    let script = format!("{}\nsleep 60", framed(Message::result(&partial).unwrap()));
    let invocation = TaskInvocation::new("SlowIndex", "/bin/sh")
        .args(["-c", script.as_str()])
        .timeout(Duration::from_millis(400))
        .header(header_in(&dir));

    let report = fast_executor().run_to_completion(invocation, &db).await;

    assert_eq!(report.status, TaskStatus::TimedOut);
    assert_eq!(report.payload["hits"], json!(112));

    // The partial payload is on disk but invisible to valid-only reads
    let raw = db.read_latest("SlowIndex", "payload", false).await.unwrap();
    let stored: serde_json::Value =
        serde_json::from_str(raw.unwrap().as_str().unwrap()).unwrap();
    assert_eq!(stored["hits"], json!(112));
    assert_eq!(db.read_latest("SlowIndex", "payload", true).await.unwrap(), None);
}

#[tokio::test]
async fn test_cancellation_yields_cancelled_row() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    let invocation = TaskInvocation::new("LongHaul", "/bin/sh")
        .args(["-c", "sleep 60"])
        .header(header_in(&dir));

    let executor = fast_executor();
    let (handle, rx) = executor.start();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.cancel();
    });
    let report = executor.run(invocation, &db, rx).await;

    assert_eq!(report.status, TaskStatus::Cancelled);
    let status = db.read_latest("LongHaul", "task_status", false).await.unwrap();
    assert_eq!(status, Some(json!("CANCELLED")));
}

#[tokio::test]
async fn test_first_party_result_arrives_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    // Helper binary connects back through LATHE_SOCKET and reports a
    // payload far too large for comfortable line framing
    let invocation = TaskInvocation::new("BulkReport", env!("CARGO_BIN_EXE_lathe-task-helper"))
        .first_party()
        .args(["big-result"])
        .header(header_in(&dir));

    let report = fast_executor().run_to_completion(invocation, &db).await;

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.summary, "bulk done");
    assert_eq!(report.payload["blob"].as_str().unwrap().len(), 1 << 20);
    assert_eq!(db.count_rows("BulkReport").await.unwrap(), 1);

    // The per-run socket is gone once the run finishes
    let leftover: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().map(|e| e == "sock").unwrap_or(false))
        .collect();
    assert!(leftover.is_empty(), "socket file left behind: {:?}", leftover);
}

#[tokio::test]
async fn test_first_party_cancel_is_cooperative() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    let invocation = TaskInvocation::new("Attentive", env!("CARGO_BIN_EXE_lathe-task-helper"))
        .first_party()
        .args(["wait-signal"])
        .header(header_in(&dir));

    let executor = fast_executor();
    let (handle, rx) = executor.start();
    tokio::spawn(async move {
        // Long enough for the helper to connect and report progress
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();
    });
    let report = executor.run(invocation, &db, rx).await;

    assert_eq!(report.status, TaskStatus::Cancelled);
    let status = db.read_latest("Attentive", "task_status", false).await.unwrap();
    assert_eq!(status, Some(json!("CANCELLED")));
}

#[tokio::test]
async fn test_malformed_frame_fails_run_but_still_records() {
    let dir = tempfile::tempdir().unwrap();
    let db = ConfigDatabase::open(dir.path()).await.unwrap();

    // Frame prefix followed by garbage: a broken first-party speaker
    let invocation = TaskInvocation::new("Corrupt", "/bin/sh")
        .args(["-c", "printf '\\036{not json\\n'; exit 0"])
        .header(header_in(&dir));

    let report = fast_executor().run_to_completion(invocation, &db).await;

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(db.count_rows("Corrupt").await.unwrap(), 1);
}
