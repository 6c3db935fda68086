//! The persisted shape of one invocation

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use lathe_config::AnalysisHeader;
use lathe_ipc::TaskStatus;

/// Execution-environment descriptor, deduplicated across invocations that
/// share an Executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecDescriptor {
    /// Selected environment variables as `KEY=VALUE`, `;`-joined
    pub env: String,
    /// Poll interval of the Executor loop, seconds
    pub poll_interval_s: f64,
    /// Descriptions of the attached communicators, `;`-joined
    pub communicators: String,
}

/// Outcome portion of an invocation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedResult {
    pub status: TaskStatus,
    pub summary: String,
    /// Result payload or pointer to external output; JSON null when the
    /// task produced no structured result
    pub payload: JsonValue,
    /// Result-schema tags the task implements
    pub schemas: Vec<String>,
    /// Overrides the default validity (`status == Completed`) when set.
    /// Stays independently mutable after the fact via the database API.
    pub valid_override: Option<bool>,
}

impl RecordedResult {
    /// Validity persisted at insert time.
    pub fn valid_flag(&self) -> bool {
        self.valid_override
            .unwrap_or(self.status == TaskStatus::Completed)
    }
}

/// Everything the Executor hands to the write path for one invocation.
/// Created exactly once, at finalization; the task itself never touches
/// the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub task_name: String,
    pub header: AnalysisHeader,
    pub descriptor: ExecDescriptor,
    /// Flattened (dotted-key) resolved parameters, in declaration order
    pub parameters: Vec<(String, JsonValue)>,
    pub result: RecordedResult,
}
