//! Storage error types

use thiserror::Error;

/// Result type for storage operations
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// Database open/connection failure
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failure
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Identifier (table/column name) rejected by validation
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Requested row does not exist
    #[error("No such entry: {table} id {id}")]
    NoSuchEntry { table: String, id: i64 },

    /// Serialization of a persisted value failed
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
