//! Lathe execution engine
//!
//! The Executor drives one task invocation through its bounded lifecycle:
//! spawn, poll, terminate or time out, finalize, persist. Tasks never know
//! where they run or how their output is consumed.

pub mod environment;
pub mod error;
pub mod executor;
pub mod process;
pub mod task;
pub mod template;

pub use environment::{prepare_environment, summarize_environment};
pub use error::ExecutionError;
pub use executor::{CancelHandle, ExecutionContext, ExecutionReport, Executor, ExecutorConfig};
pub use task::{PathPolicy, TaskInvocation, TaskKind};
pub use template::{TemplateRenderer, TemplateRequest};
