//! Embedded config/result database
//!
//! One SQLite file per working directory records every invocation: shared
//! header and execution-descriptor rows are deduplicated, and each task type
//! gets its own table whose columns mirror the task's parameter set and grow
//! additively as the parameter set evolves.

pub mod database;
pub mod error;
pub mod record;
pub mod schema;

pub use database::ConfigDatabase;
pub use error::{DbError, DbResult};
pub use record::{AnalysisConfig, ExecDescriptor, RecordedResult};

/// Database file name inside a working directory
pub const DB_FILE_NAME: &str = "lathe.db";
