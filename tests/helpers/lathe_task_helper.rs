//! Small first-party task driven by the lifecycle tests.
//!
//! The mode comes from the first argument:
//!   big-result  - report a ~1 MiB result payload
//!   wait-signal - report progress, then wait for a cooperative stop

use lathe_ipc::{MessageKind, Reporter, TaskOutcome};
use serde_json::json;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mode = std::env::args().nth(1).unwrap_or_default();
    let mut reporter = Reporter::from_env().await;
    reporter.start(&json!({ "mode": mode })).await.unwrap();

    match mode.as_str() {
        "big-result" => {
            let outcome = TaskOutcome::new("bulk done", json!({ "blob": "x".repeat(1 << 20) }));
            reporter.result(&outcome).await.unwrap();
        }
        "wait-signal" => {
            reporter.progress("waiting").await.unwrap();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).unwrap();
            loop {
                if let Ok(Some(message)) = reporter.poll_signal() {
                    if message.kind == MessageKind::Signal {
                        reporter.progress("stopping").await.ok();
                        return;
                    }
                }
                tokio::select! {
                    _ = sigterm.recv() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
                }
            }
        }
        other => {
            reporter
                .exception(format!("unknown mode: {other}"))
                .await
                .ok();
            std::process::exit(2);
        }
    }
}
