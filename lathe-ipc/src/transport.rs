//! Communicator transports attaching an Executor to a task subprocess
//!
//! Both transports run background reader tasks that continuously drain their
//! OS handles into an in-memory queue. The Executor polls that queue with
//! [`Communicator::try_read`]; the subprocess can therefore never stall on a
//! full pipe buffer, no matter how rarely the Executor polls.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CommError;
use crate::protocol::{
    parse_pipe_line, read_frame, write_frame, Message, MessageEnvelope, PipeFrame,
};

/// Transport kind of a communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommMode {
    Pipe,
    Socket,
}

type Inbound = Result<Message, CommError>;

/// Channel abstraction carrying messages between a task subprocess and its
/// Executor. A communicator owns its OS handles for exactly one invocation
/// and never outlives the task process.
#[async_trait]
pub trait Communicator: Send {
    fn mode(&self) -> CommMode;

    /// Human-readable description, persisted with the execution descriptor.
    fn describe(&self) -> String;

    /// Drain one buffered message without blocking.
    ///
    /// `Ok(None)` means nothing is pending right now. `Err(Disconnected)`
    /// means the stream ended and the buffer is empty; the communicator is
    /// exhausted. Any other error closes this communicator but must not
    /// abort its siblings.
    fn try_read(&mut self) -> Result<Option<Message>, CommError>;

    /// Push a message toward the task. Only bidirectional transports
    /// support this.
    async fn write(&mut self, message: &Message) -> Result<(), CommError>;

    /// Release all handles. Idempotent.
    async fn close(&mut self) -> Result<(), CommError>;
}

fn drain_inbound(
    rx: &mut Option<UnboundedReceiver<Inbound>>,
) -> Result<Option<Message>, CommError> {
    let Some(receiver) = rx.as_mut() else {
        return Err(CommError::Disconnected);
    };
    match receiver.try_recv() {
        Ok(Ok(message)) => Ok(Some(message)),
        Ok(Err(e)) => Err(e),
        Err(TryRecvError::Empty) => Ok(None),
        Err(TryRecvError::Disconnected) => {
            *rx = None;
            Err(CommError::Disconnected)
        }
    }
}

/// Reads the subprocess's standard streams.
///
/// Stdout lines carrying the frame prefix are structured messages; anything
/// else (including every stderr line) is captured best-effort as a Log
/// message. This is the uniform path for third-party binaries that know
/// nothing about framing.
pub struct PipeCommunicator {
    rx: Option<UnboundedReceiver<Inbound>>,
    tx: Option<UnboundedSender<Inbound>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipeCommunicator {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx: Some(rx),
            tx: Some(tx),
            tasks: Vec::new(),
        }
    }

    /// Take ownership of the child's stdout/stderr and start draining them.
    pub fn attach(&mut self, child: &mut tokio::process::Child) -> Result<(), CommError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CommError::IoError("child stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CommError::IoError("child stderr not piped".to_string()))?;
        let tx = self
            .tx
            .take()
            .ok_or_else(|| CommError::IoError("communicator already attached".to_string()))?;

        let out_tx = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_pipe_line(&line) {
                        Ok(PipeFrame::Message(envelope)) => {
                            if out_tx.send(Ok(envelope.message)).is_err() {
                                break;
                            }
                        }
                        Ok(PipeFrame::Raw(raw)) => {
                            if !raw.is_empty() && out_tx.send(Ok(Message::log(raw))).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // Malformed framing kills this stream only
                            let _ = out_tx.send(Err(e));
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        let _ = out_tx.send(Err(e.into()));
                        break;
                    }
                }
            }
        }));

        self.tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                if tx.send(Ok(Message::log(line))).is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }
}

impl Default for PipeCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Communicator for PipeCommunicator {
    fn mode(&self) -> CommMode {
        CommMode::Pipe
    }

    fn describe(&self) -> String {
        "PipeCommunicator: RS-framed lines over stdout, raw capture of stderr".to_string()
    }

    fn try_read(&mut self) -> Result<Option<Message>, CommError> {
        drain_inbound(&mut self.rx)
    }

    async fn write(&mut self, _message: &Message) -> Result<(), CommError> {
        Err(CommError::Unsupported(
            "pipe communicator is read-only on the executor side",
        ))
    }

    async fn close(&mut self) -> Result<(), CommError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.rx = None;
        self.tx = None;
        Ok(())
    }
}

/// Listens on a filesystem-scoped Unix socket.
///
/// Length-prefixed frames permit payloads far larger than any pipe buffer
/// and let the Executor push Signal messages back to a cooperative task.
/// Connection setup is advisory: a task that never connects is simply
/// observed through pipes alone.
pub struct SocketCommunicator {
    path: PathBuf,
    rx: Option<UnboundedReceiver<Inbound>>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: Option<JoinHandle<()>>,
}

impl SocketCommunicator {
    /// Bind the socket before the subprocess is spawned. The path is handed
    /// to the task through [`crate::protocol::SOCKET_ENV_VAR`].
    pub fn bind(path: &Path) -> Result<Self, CommError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        debug!(path = %path.display(), "socket communicator bound");

        let (tx, rx) = mpsc::unbounded_channel::<Inbound>();
        let writer: Arc<Mutex<Option<OwnedWriteHalf>>> = Arc::new(Mutex::new(None));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_writer = Arc::clone(&writer);
        let accept_tasks = Arc::clone(&tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("socket accept failed: {}", e);
                        break;
                    }
                };
                let (mut read_half, write_half) = stream.into_split();
                // Keep the newest peer for executor-to-task signaling
                *accept_writer.lock().await = Some(write_half);

                let conn_tx = tx.clone();
                let reader = tokio::spawn(async move {
                    loop {
                        match read_frame(&mut read_half).await {
                            Ok(Some(envelope)) => {
                                if conn_tx.send(Ok(envelope.message)).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let _ = conn_tx.send(Err(e));
                                break;
                            }
                        }
                    }
                });
                accept_tasks.lock().await.push(reader);
            }
        });

        Ok(Self {
            path: path.to_path_buf(),
            rx: Some(rx),
            writer,
            tasks,
            accept_task: Some(accept_task),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting new peers. Frames from already connected peers stay
    /// readable; once their streams end, the inbound channel reports
    /// `Disconnected` instead of staying silently open forever.
    pub fn stop_accepting(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

// The executor closes explicitly on the normal path; this covers early
// returns where the communicator was bound but the run never started.
impl Drop for SocketCommunicator {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[async_trait]
impl Communicator for SocketCommunicator {
    fn mode(&self) -> CommMode {
        CommMode::Socket
    }

    fn describe(&self) -> String {
        "SocketCommunicator: length-prefixed frames over a Unix socket".to_string()
    }

    fn try_read(&mut self) -> Result<Option<Message>, CommError> {
        drain_inbound(&mut self.rx)
    }

    async fn write(&mut self, message: &Message) -> Result<(), CommError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CommError::NotConnected)?;
        let envelope = MessageEnvelope::new(message.clone());
        match write_frame(writer, &envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Peer went away; drop the stale half so later writes report
                // NotConnected instead of repeated IO errors
                *guard = None;
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), CommError> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        *self.writer.lock().await = None;
        self.rx = None;
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        Ok(())
    }
}
