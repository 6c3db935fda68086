//! Inter-process communication for Lathe
//!
//! This crate provides the message protocol, framing, and communicator
//! transports used between an Executor and the task subprocess it manages,
//! along with the task-side reporter used by first-party task code.

pub mod error;
pub mod protocol;
pub mod reporter;
pub mod transport;

// Re-export commonly used types
pub use error::CommError;
pub use protocol::{
    Message, MessageEnvelope, MessageKind, TaskOutcome, TaskStatus, IPC_PROTOCOL_VERSION,
    SOCKET_ENV_VAR,
};
pub use reporter::Reporter;
pub use transport::{CommMode, Communicator, PipeCommunicator, SocketCommunicator};
