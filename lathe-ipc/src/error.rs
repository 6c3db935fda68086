//! IPC error types

use thiserror::Error;

/// Communicator error types
#[derive(Debug, Error)]
pub enum CommError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Malformed frame on the wire
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Peer closed the channel and all buffered messages were drained
    #[error("Channel disconnected")]
    Disconnected,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// Frame exceeds the maximum permitted payload size
    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: u32, max: u32 },

    /// No peer connected on a bidirectional transport
    #[error("No peer connected")]
    NotConnected,

    /// Operation not supported by this transport
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl CommError {
    /// Whether this error closes the communicator for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommError::MalformedFrame(_)
                | CommError::ProtocolVersionMismatch { .. }
                | CommError::FrameTooLarge { .. }
                | CommError::Disconnected
        )
    }
}

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        CommError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CommError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            CommError::IoError(err.to_string())
        } else if err.is_data() {
            CommError::MalformedFrame(err.to_string())
        } else {
            CommError::SerializationError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CommError::MalformedFrame("bad".into()).is_fatal());
        assert!(CommError::ProtocolVersionMismatch { expected: 1, actual: 2 }.is_fatal());
        assert!(CommError::Disconnected.is_fatal());
        assert!(!CommError::IoError("transient".into()).is_fatal());
        assert!(!CommError::NotConnected.is_fatal());
    }
}
