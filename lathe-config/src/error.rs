//! Configuration error types

use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading a parameter document
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// JSON conversion error
    #[error("Failed to convert value: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A required field was not supplied and has no default
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// A derivation rule failed
    #[error("Derivation failed for parameter {name}: {message}")]
    DerivationError { name: String, message: String },

    /// Document structure error
    #[error("Invalid parameter document: {0}")]
    InvalidDocument(String),
}
