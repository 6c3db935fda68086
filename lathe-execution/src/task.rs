//! Task invocation description

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use lathe_config::{AnalysisHeader, ResolvedParameters};

use crate::template::TemplateRequest;

/// Whether a task speaks the framing protocol or is an opaque binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Cooperative code using the task-side reporter; structured Status and
    /// Result messages are expected
    FirstParty,
    /// Arbitrary executable; only best-effort Log capture is possible
    ThirdParty,
}

/// How a PATH override combines with the inherited PATH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathPolicy {
    #[default]
    Prepend,
    Append,
    Overwrite,
}

/// One fully resolved, already validated unit of work.
///
/// Parameter validation happens in the parameter model before this struct
/// is built; the Executor does not re-validate business parameters.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    /// Task type name; also names the database table
    pub task_name: String,
    /// Unique id of this run
    pub run_id: Uuid,
    pub kind: TaskKind,
    /// Executable path (third-party) or entry-point binary (first-party)
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Declared wall-clock timeout
    pub timeout: Duration,
    /// Environment variable overrides applied on top of the inherited
    /// environment
    pub env: HashMap<String, String>,
    pub path_policy: PathPolicy,
    /// Shared analysis header, persisted once per distinct value set
    pub header: AnalysisHeader,
    /// Resolved parameters, persisted with the invocation row
    pub parameters: ResolvedParameters,
    /// Third-party configuration files to render before spawn
    pub templates: Vec<TemplateRequest>,
}

impl TaskInvocation {
    pub fn new(task_name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        let header = AnalysisHeader::default();
        Self {
            task_name: task_name.into(),
            run_id: Uuid::new_v4(),
            kind: TaskKind::ThirdParty,
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(header.task_timeout_s),
            env: HashMap::new(),
            path_policy: PathPolicy::default(),
            header,
            parameters: ResolvedParameters::empty(),
            templates: Vec::new(),
        }
    }

    pub fn first_party(mut self) -> Self {
        self.kind = TaskKind::FirstParty;
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(mut self, header: AnalysisHeader) -> Self {
        self.header = header;
        self
    }

    pub fn parameters(mut self, parameters: ResolvedParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn path_policy(mut self, policy: PathPolicy) -> Self {
        self.path_policy = policy;
        self
    }
}
