//! The Executor lifecycle driver
//!
//! One [`Executor::run`] call drives one task invocation from spawn to a
//! terminal state and persists exactly one database row for it. Failures
//! anywhere in the lifecycle are folded into the terminal state and its
//! summary; running a task never crashes the orchestrator.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use lathe_ipc::{
    CommError, Communicator, Message, PipeCommunicator, SocketCommunicator, TaskOutcome,
    TaskStatus,
};
use lathe_storage::{AnalysisConfig, ConfigDatabase, ExecDescriptor, RecordedResult};

use crate::environment::{prepare_environment, summarize_environment};
use crate::error::ExecutionError;
use crate::process::{signal_group, spawn_task};
use crate::task::{TaskInvocation, TaskKind};
use crate::template::{NoTemplates, TemplateRenderer};

/// Lines of captured log output kept for the failure summary
const LOG_TAIL_LINES: usize = 20;

/// File that receives serialized records when the database itself is the
/// thing that failed
const FALLBACK_FILE_NAME: &str = "lathe_db_fallback.jsonl";

/// Tuning knobs of the lifecycle loop
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Delay between poll iterations
    pub poll_interval: Duration,
    /// Time a task gets between SIGTERM and SIGKILL
    pub grace_period: Duration,
    /// Where the per-run Unix socket is created; working directory when unset
    pub socket_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(2),
            socket_dir: None,
        }
    }
}

/// Handle for requesting cancellation of a running invocation from another
/// task. Requests are idempotent and race-free against natural exit.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Identity and placement of one run, fixed before the process spawns.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub task_name: String,
    pub work_dir: PathBuf,
}

/// What the caller gets back after the lifecycle completes.
#[derive(Debug)]
pub struct ExecutionReport {
    pub context: ExecutionContext,
    pub status: TaskStatus,
    pub summary: String,
    /// Structured result payload, including partial results captured before
    /// a timeout or cancellation
    pub payload: JsonValue,
}

/// Drives task subprocesses through PENDING, RUNNING and one terminal
/// state. Reusable across invocations; each run gets fresh communicators
/// and a fresh cancellation channel.
pub struct Executor {
    config: ExecutorConfig,
    renderer: Arc<dyn TemplateRenderer>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            renderer: Arc::new(NoTemplates),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Run one invocation to a terminal state, persist its record, and
    /// report the outcome. The returned handle cancels this run only.
    pub fn start(&self) -> (CancelHandle, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, rx)
    }

    #[instrument(skip_all, fields(task = %invocation.task_name, run_id = %invocation.run_id))]
    pub async fn run(
        &self,
        invocation: TaskInvocation,
        db: &ConfigDatabase,
        mut cancel: watch::Receiver<bool>,
    ) -> ExecutionReport {
        let context = ExecutionContext {
            run_id: invocation.run_id,
            task_name: invocation.task_name.clone(),
            work_dir: PathBuf::from(invocation.header.resolved_work_dir()),
        };
        info!(status = %TaskStatus::Pending, "invocation accepted");

        // Everything up to the successful spawn can fail without the task
        // ever entering RUNNING; those failures finalize as FAILED directly.
        let setup = self.prepare(&invocation, &context).await;
        let mut run = match setup {
            Ok(run) => run,
            Err(e) => {
                warn!("setup failed before spawn: {}", e);
                let outcome = Finalization {
                    status: TaskStatus::Failed,
                    summary: format!("setup failed: {e}"),
                    env: String::new(),
                    communicators: String::new(),
                };
                return self
                    .finalize(&invocation, context, db, Gathered::default(), outcome)
                    .await;
            }
        };

        info!(status = %TaskStatus::Running, "task process spawned");
        let deadline = Instant::now() + invocation.timeout;
        let mut gathered = Gathered::default();
        let mut termination: Option<Termination> = None;
        let exit_ok;

        loop {
            // Buffered messages drain before any deadline decision so a
            // result emitted just before the timeout is never lost
            run.drain(&mut gathered);

            match run.child.try_wait() {
                Ok(Some(status)) => {
                    exit_ok = status.success();
                    debug!(exit = ?status.code(), "task process exited");
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("wait on task process failed: {}", e);
                    gathered.note_error(e.to_string());
                    exit_ok = false;
                    break;
                }
            }

            match termination.as_mut() {
                None => {
                    let requested = if *cancel.borrow_and_update() {
                        Some(TaskStatus::Cancelled)
                    } else if Instant::now() >= deadline {
                        Some(TaskStatus::TimedOut)
                    } else {
                        None
                    };
                    if let Some(status) = requested {
                        info!(%status, "initiating termination");
                        run.request_stop().await;
                        termination = Some(Termination {
                            status,
                            kill_at: Instant::now() + self.config.grace_period,
                            killed: false,
                        });
                    }
                }
                Some(t) if !t.killed && Instant::now() >= t.kill_at => {
                    debug!("grace period elapsed, killing task process group");
                    t.killed = true;
                    if signal_group(&run.child, nix::sys::signal::Signal::SIGKILL).is_err() {
                        if let Err(e) = run.child.start_kill() {
                            warn!("kill failed: {}", e);
                        }
                    }
                }
                Some(_) => {}
            }

            sleep(self.config.poll_interval).await;
        }

        // Reader tasks may still hold buffered output after exit
        run.settle(&mut gathered).await;
        let env = run.env_summary.clone();
        let communicators = run.shutdown().await;

        let status = match termination {
            Some(t) => t.status,
            None if exit_ok && gathered.exception.is_none() && gathered.comm_error.is_none() => {
                TaskStatus::Completed
            }
            None => TaskStatus::Failed,
        };
        let summary = gathered.summarize(status, exit_ok);
        let outcome = Finalization {
            status,
            summary,
            env,
            communicators,
        };
        self.finalize(&invocation, context, db, gathered, outcome)
            .await
    }

    async fn prepare(
        &self,
        invocation: &TaskInvocation,
        context: &ExecutionContext,
    ) -> Result<ActiveRun, ExecutionError> {
        std::fs::create_dir_all(&context.work_dir)?;
        for request in &invocation.templates {
            self.renderer.render(request)?;
        }

        let env = prepare_environment(&invocation.env, invocation.path_policy);

        // The socket only matters for cooperative tasks; third-party
        // binaries are observed through their pipes alone
        let socket = match invocation.kind {
            TaskKind::FirstParty => {
                let dir = self
                    .config
                    .socket_dir
                    .clone()
                    .unwrap_or_else(|| context.work_dir.clone());
                let path = dir.join(format!("lathe-{}.sock", invocation.run_id));
                Some(SocketCommunicator::bind(&path)?)
            }
            TaskKind::ThirdParty => None,
        };

        let socket_path = socket.as_ref().map(|s| s.socket_path().to_path_buf());
        let mut child = spawn_task(invocation, &env, socket_path.as_deref())?;

        let mut pipe = PipeCommunicator::new();
        pipe.attach(&mut child)?;

        Ok(ActiveRun {
            child,
            env_summary: summarize_environment(&env),
            pipe,
            pipe_exhausted: false,
            socket,
            socket_exhausted: false,
        })
    }

    async fn finalize(
        &self,
        invocation: &TaskInvocation,
        context: ExecutionContext,
        db: &ConfigDatabase,
        gathered: Gathered,
        outcome: Finalization,
    ) -> ExecutionReport {
        debug_assert!(outcome.status.is_terminal());
        info!(status = %outcome.status, "invocation finalized");
        let (payload, schemas) = match gathered.outcome {
            Some(result) => (result.payload, result.schemas),
            None => (JsonValue::Null, Vec::new()),
        };

        let record = AnalysisConfig {
            task_name: invocation.task_name.clone(),
            header: invocation.header.clone(),
            descriptor: ExecDescriptor {
                env: outcome.env,
                poll_interval_s: self.config.poll_interval.as_secs_f64(),
                communicators: outcome.communicators,
            },
            parameters: invocation.parameters.flatten(),
            result: RecordedResult {
                status: outcome.status,
                summary: outcome.summary.clone(),
                payload: payload.clone(),
                schemas,
                valid_override: None,
            },
        };
        self.persist(db, &record, &context).await;

        ExecutionReport {
            context,
            status: outcome.status,
            summary: outcome.summary,
            payload,
        }
    }

    /// One retry on a failed write, then the record goes to a local
    /// fallback file instead of being dropped.
    async fn persist(&self, db: &ConfigDatabase, record: &AnalysisConfig, context: &ExecutionContext) {
        for attempt in 0..2u32 {
            match db.record_analysis(record).await {
                Ok(()) => return,
                Err(e) => warn!(attempt, "failed to record invocation: {}", e),
            }
        }
        let path = context.work_dir.join(FALLBACK_FILE_NAME);
        match serde_json::to_string(record) {
            Ok(line) => {
                use std::io::Write;
                let appended = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .and_then(|mut f| writeln!(f, "{line}"));
                match appended {
                    Ok(()) => warn!(path = %path.display(), "record diverted to fallback file"),
                    Err(e) => warn!("fallback write failed, record lost: {}", e),
                }
            }
            Err(e) => warn!("record serialization failed, record lost: {}", e),
        }
    }
}

struct Finalization {
    status: TaskStatus,
    summary: String,
    env: String,
    communicators: String,
}

impl Executor {
    /// Convenience wrapper when no external cancellation is needed.
    pub async fn run_to_completion(
        &self,
        invocation: TaskInvocation,
        db: &ConfigDatabase,
    ) -> ExecutionReport {
        let (_handle, rx) = self.start();
        self.run(invocation, db, rx).await
    }
}

struct Termination {
    status: TaskStatus,
    kill_at: Instant,
    killed: bool,
}

/// Live handles of a spawned run
struct ActiveRun {
    child: tokio::process::Child,
    env_summary: String,
    pipe: PipeCommunicator,
    pipe_exhausted: bool,
    socket: Option<SocketCommunicator>,
    socket_exhausted: bool,
}

impl ActiveRun {
    fn drain(&mut self, gathered: &mut Gathered) {
        drain_one(&mut self.pipe, &mut self.pipe_exhausted, gathered);
        if let Some(socket) = self.socket.as_mut() {
            drain_one(socket, &mut self.socket_exhausted, gathered);
        }
    }

    /// Cooperative stop request: a Signal frame for socket peers, SIGTERM
    /// for everyone.
    async fn request_stop(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            match socket.write(&Message::signal("terminate")).await {
                Ok(()) | Err(CommError::NotConnected) => {}
                Err(e) => debug!("stop signal over socket failed: {}", e),
            }
        }
        if let Err(e) = signal_group(&self.child, nix::sys::signal::Signal::SIGTERM) {
            warn!("{}", e);
        }
    }

    /// Give the reader tasks a moment to forward output buffered at exit.
    /// The process is gone, so no new socket peer can arrive; stopping the
    /// accept loop lets the inbound channel actually end instead of the
    /// settle window always running out.
    async fn settle(&mut self, gathered: &mut Gathered) {
        if let Some(socket) = self.socket.as_mut() {
            socket.stop_accepting();
        }
        let deadline = Instant::now() + Duration::from_millis(500);
        while !(self.pipe_exhausted && (self.socket.is_none() || self.socket_exhausted)) {
            self.drain(gathered);
            if Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        self.drain(gathered);
    }

    async fn shutdown(&mut self) -> String {
        let mut described = vec![self.pipe.describe()];
        if let Err(e) = self.pipe.close().await {
            debug!("pipe close: {}", e);
        }
        if let Some(socket) = self.socket.as_mut() {
            described.push(socket.describe());
            if let Err(e) = socket.close().await {
                debug!("socket close: {}", e);
            }
        }
        described.join(";")
    }
}

fn drain_one(comm: &mut dyn Communicator, exhausted: &mut bool, gathered: &mut Gathered) {
    if *exhausted {
        return;
    }
    loop {
        match comm.try_read() {
            Ok(Some(message)) => gathered.absorb(message),
            Ok(None) => break,
            Err(CommError::Disconnected) => {
                *exhausted = true;
                break;
            }
            Err(e) => {
                warn!(mode = ?comm.mode(), "communicator failed: {}", e);
                gathered.note_error(e.to_string());
                if e.is_fatal() {
                    *exhausted = true;
                }
                break;
            }
        }
    }
}

/// Accumulated view of everything the task reported
#[derive(Default)]
struct Gathered {
    last_status: Option<String>,
    outcome: Option<TaskOutcome>,
    exception: Option<String>,
    comm_error: Option<String>,
    log_tail: VecDeque<String>,
}

impl Gathered {
    fn absorb(&mut self, message: Message) {
        match message.kind {
            lathe_ipc::MessageKind::Status => {
                self.last_status = message.text().map(str::to_string);
            }
            lathe_ipc::MessageKind::Result => {
                match message.as_outcome() {
                    Some(outcome) => self.outcome = Some(outcome),
                    None => self.note_error("unreadable result payload".to_string()),
                }
            }
            lathe_ipc::MessageKind::Log => {
                if let Some(line) = message.text() {
                    if self.log_tail.len() == LOG_TAIL_LINES {
                        self.log_tail.pop_front();
                    }
                    self.log_tail.push_back(line.to_string());
                }
            }
            lathe_ipc::MessageKind::Exception => {
                self.exception = message.text().map(str::to_string);
            }
            // Signals flow executor-to-task only
            lathe_ipc::MessageKind::Signal => {}
        }
    }

    fn note_error(&mut self, error: String) {
        self.comm_error.get_or_insert(error);
    }

    fn summarize(&self, status: TaskStatus, exit_ok: bool) -> String {
        if let Some(outcome) = &self.outcome {
            if !outcome.summary.is_empty() {
                return outcome.summary.clone();
            }
        }
        if let Some(exception) = &self.exception {
            return exception.clone();
        }
        if let Some(error) = &self.comm_error {
            return error.clone();
        }
        if let Some(text) = &self.last_status {
            return text.clone();
        }
        if !self.log_tail.is_empty() {
            return self
                .log_tail
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
        }
        match (status, exit_ok) {
            (TaskStatus::Completed, _) => "completed".to_string(),
            (_, false) => "task process exited with a failure status".to_string(),
            (status, true) => format!("terminated as {status}"),
        }
    }
}
