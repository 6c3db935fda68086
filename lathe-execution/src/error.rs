//! Execution error types

use thiserror::Error;

/// Errors raised while driving a task invocation.
///
/// All of these are caught at the Executor boundary and folded into one of
/// the terminal states plus a diagnostic summary; none escape to crash the
/// calling orchestrator.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The subprocess could not be started at all
    #[error("Failed to spawn task process: {0}")]
    SpawnError(String),

    /// Communicator failure
    #[error("Communication error: {0}")]
    CommError(#[from] lathe_ipc::CommError),

    /// Database write/read failure
    #[error("Database error: {0}")]
    DatabaseError(#[from] lathe_storage::DbError),

    /// Parameter model failure
    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] lathe_config::ConfigError),

    /// Template rendering collaborator failure
    #[error("Template rendering failed for {template}: {message}")]
    TemplateError { template: String, message: String },

    /// OS-level failure while managing the subprocess
    #[error("Process management error: {0}")]
    IoError(#[from] std::io::Error),
}
