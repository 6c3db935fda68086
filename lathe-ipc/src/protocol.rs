//! IPC protocol definitions, message types and framing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CommError;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the Unix socket path to the subprocess
pub const SOCKET_ENV_VAR: &str = "LATHE_SOCKET";

/// First byte of a structured frame on a pipe (RFC 7464 record separator).
/// Lines without this prefix are uncontrolled subprocess output.
pub const FRAME_PREFIX: u8 = 0x1E;

/// Upper bound for a single length-prefixed socket frame
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// The kind of a message, used for routing at the Executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Progress or lifecycle update
    Status,
    /// Structured task result
    Result,
    /// Free-form output line
    Log,
    /// Fatal error raised by the task
    Exception,
    /// Control message (e.g. cancellation request)
    Signal,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Status => "status",
            MessageKind::Result => "result",
            MessageKind::Log => "log",
            MessageKind::Exception => "exception",
            MessageKind::Signal => "signal",
        };
        write!(f, "{}", s)
    }
}

/// The unit of IPC content: a kind plus an opaque payload.
///
/// Messages are immutable once constructed. Ordering is FIFO within one
/// communicator; nothing is guaranteed across communicators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: JsonValue,
}

impl Message {
    pub fn status(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Status,
            payload: JsonValue::String(text.into()),
        }
    }

    pub fn result(outcome: &TaskOutcome) -> Result<Self, CommError> {
        Ok(Self {
            kind: MessageKind::Result,
            payload: serde_json::to_value(outcome)
                .map_err(|e| CommError::SerializationError(e.to_string()))?,
        })
    }

    pub fn log(line: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Log,
            payload: JsonValue::String(line.into()),
        }
    }

    pub fn exception(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Exception,
            payload: JsonValue::String(text.into()),
        }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Signal,
            payload: JsonValue::String(name.into()),
        }
    }

    /// Interpret a Result message payload as a [`TaskOutcome`].
    pub fn as_outcome(&self) -> Option<TaskOutcome> {
        if self.kind != MessageKind::Result {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// String payload, if the payload is a plain string.
    pub fn text(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

/// Versioned envelope wrapping every message on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: Message,
}

impl MessageEnvelope {
    pub fn new(message: Message) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    fn check_version(self) -> Result<Self, CommError> {
        if self.protocol_version != IPC_PROTOCOL_VERSION {
            return Err(CommError::ProtocolVersionMismatch {
                expected: IPC_PROTOCOL_VERSION,
                actual: self.protocol_version,
            });
        }
        Ok(self)
    }
}

/// Terminal and transient states of a task invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Environment prepared, subprocess not yet spawned
    Pending,
    /// Subprocess running under the poll loop
    Running,
    /// Exit code 0 with no exception observed
    Completed,
    /// Non-zero exit, spawn failure, or exception message
    Failed,
    /// Declared timeout exceeded
    TimedOut,
    /// External cancellation request honored
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are final; no state is re-entered.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::TimedOut => "TIMED_OUT",
            TaskStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Structured body of a Result message.
///
/// `schemas` lists the result-schema tags the task implements, so consumers
/// can discover output layout without a code-level dependency on the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub summary: String,
    pub payload: JsonValue,
    #[serde(default)]
    pub schemas: Vec<String>,
}

impl TaskOutcome {
    pub fn new(summary: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            summary: summary.into(),
            payload,
            schemas: Vec::new(),
        }
    }

    pub fn with_schemas(mut self, schemas: Vec<String>) -> Self {
        self.schemas = schemas;
        self
    }
}

/// A line read from a pipe, either a structured frame or raw output
#[derive(Debug)]
pub enum PipeFrame {
    Message(MessageEnvelope),
    Raw(String),
}

/// Encode an envelope as a single framed pipe line (RS prefix + JSON + LF).
pub fn encode_pipe_line(envelope: &MessageEnvelope) -> Result<Vec<u8>, CommError> {
    let json =
        serde_json::to_vec(envelope).map_err(|e| CommError::SerializationError(e.to_string()))?;
    let mut line = Vec::with_capacity(json.len() + 2);
    line.push(FRAME_PREFIX);
    line.extend_from_slice(&json);
    line.push(b'\n');
    Ok(line)
}

/// Classify one pipe line as a structured frame or raw output.
///
/// A line starting with the frame prefix that fails to parse is a framing
/// error; the caller is expected to close the communicator.
pub fn parse_pipe_line(line: &str) -> Result<PipeFrame, CommError> {
    let bytes = line.as_bytes();
    if bytes.first() == Some(&FRAME_PREFIX) {
        let envelope: MessageEnvelope = serde_json::from_str(&line[1..])
            .map_err(|e| CommError::MalformedFrame(e.to_string()))?;
        Ok(PipeFrame::Message(envelope.check_version()?))
    } else {
        Ok(PipeFrame::Raw(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

/// Write one length-prefixed frame (u32 big-endian length + JSON envelope).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &MessageEnvelope,
) -> Result<(), CommError> {
    let json =
        serde_json::to_vec(envelope).map_err(|e| CommError::SerializationError(e.to_string()))?;
    let len = json.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(CommError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` signals clean end-of-stream
/// at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<MessageEnvelope>, CommError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CommError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let envelope: MessageEnvelope =
        serde_json::from_slice(&buf).map_err(|e| CommError::MalformedFrame(e.to_string()))?;
    Ok(Some(envelope.check_version()?))
}
