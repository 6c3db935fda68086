//! Task-side reporting to the managing Executor
//!
//! First-party task code constructs one [`Reporter`] at startup and uses it
//! to send status, result, and exception messages. Small messages travel as
//! framed lines on stdout; results prefer the Unix socket named by
//! `LATHE_SOCKET` so payload size is not bounded by the OS pipe buffer.
//! Third-party binaries use none of this; their raw output is captured by
//! the Executor's pipe communicator.

use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::CommError;
use crate::protocol::{
    encode_pipe_line, Message, MessageEnvelope, TaskOutcome, MAX_FRAME_BYTES, SOCKET_ENV_VAR,
};

/// The Task-side half of the IPC channel.
pub struct Reporter {
    socket: Option<UnixStream>,
    // Partial inbound frame from the executor (signals)
    inbound: Vec<u8>,
}

impl Reporter {
    /// Connect to the Executor. The socket is advisory: if `LATHE_SOCKET`
    /// is unset or the connect fails, the reporter degrades to pipe-only.
    pub async fn from_env() -> Self {
        let socket = match std::env::var(SOCKET_ENV_VAR) {
            Ok(path) => match UnixStream::connect(&path).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!("no executor socket at {}: {}", path, e);
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            socket,
            inbound: Vec::new(),
        }
    }

    /// Announce that the task is underway, echoing its resolved parameters.
    pub async fn start(&mut self, parameters: &JsonValue) -> Result<(), CommError> {
        let message = Message {
            kind: crate::protocol::MessageKind::Status,
            payload: serde_json::json!({ "event": "started", "parameters": parameters }),
        };
        self.send(&message).await
    }

    /// Send a progress update.
    pub async fn progress(&mut self, text: impl Into<String>) -> Result<(), CommError> {
        self.send(&Message::status(text)).await
    }

    /// Send the structured result. Large payloads go over the socket when
    /// one is connected.
    pub async fn result(&mut self, outcome: &TaskOutcome) -> Result<(), CommError> {
        self.send(&Message::result(outcome)?).await
    }

    /// Report a fatal error before exiting non-zero.
    pub async fn exception(&mut self, text: impl Into<String>) -> Result<(), CommError> {
        self.send(&Message::exception(text)).await
    }

    /// Check for a pending Signal message from the Executor without
    /// blocking. Used by cooperative tasks to honor cancellation.
    pub fn poll_signal(&mut self) -> Result<Option<Message>, CommError> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(None);
        };
        loop {
            let mut chunk = [0u8; 4096];
            match socket.try_read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if self.inbound.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.inbound[0],
            self.inbound[1],
            self.inbound[2],
            self.inbound[3],
        ]);
        if len > MAX_FRAME_BYTES {
            return Err(CommError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_BYTES,
            });
        }
        let end = 4 + len as usize;
        if self.inbound.len() < end {
            return Ok(None);
        }
        let envelope: MessageEnvelope = serde_json::from_slice(&self.inbound[4..end])
            .map_err(|e| CommError::MalformedFrame(e.to_string()))?;
        self.inbound.drain(..end);
        Ok(Some(envelope.message))
    }

    async fn send(&mut self, message: &Message) -> Result<(), CommError> {
        let envelope = MessageEnvelope::new(message.clone());
        if let Some(socket) = self.socket.as_mut() {
            match crate::protocol::write_frame(socket, &envelope).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("socket send failed, falling back to pipe: {}", e);
                    self.socket = None;
                }
            }
        }
        let line = encode_pipe_line(&envelope)?;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }
}
