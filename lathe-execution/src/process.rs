//! Child process spawn and signalling helpers

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

use lathe_ipc::SOCKET_ENV_VAR;

use crate::error::ExecutionError;
use crate::task::TaskInvocation;

/// Spawns the task process with piped stdout/stderr.
///
/// The environment is fully explicit: the command starts from a cleared
/// environment and receives exactly the prepared map, plus the socket
/// path when one is bound. The child leads its own process group so
/// termination signals reach any grandchildren it spawns.
pub fn spawn_task(
    invocation: &TaskInvocation,
    env: &HashMap<String, String>,
    socket_path: Option<&Path>,
) -> Result<Child, ExecutionError> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(path) = socket_path {
        command.env(SOCKET_ENV_VAR, path);
    }

    debug!(
        program = %invocation.program.display(),
        task = %invocation.task_name,
        "spawning task process"
    );

    command.spawn().map_err(|e| {
        ExecutionError::SpawnError(format!(
            "failed to spawn {}: {}",
            invocation.program.display(),
            e
        ))
    })
}

/// Best-effort signal delivery to the task's whole process group. A dead
/// process is not a failure here.
pub fn signal_group(child: &Child, signal: Signal) -> Result<(), ExecutionError> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ExecutionError::SpawnError(format!(
            "failed to signal process group {pid}: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PathPolicy;

    #[tokio::test]
    async fn test_spawn_missing_program_is_spawn_error() {
        let invocation = TaskInvocation::new("Broken", "/nonexistent/lathe-test-binary");
        let env = crate::environment::prepare_environment(&HashMap::new(), PathPolicy::Prepend);
        let result = spawn_task(&invocation, &env, None);
        assert!(matches!(result, Err(ExecutionError::SpawnError(_))));
    }

    #[tokio::test]
    async fn test_sigterm_reaches_grandchildren() {
        // sh spawns a grandchild sleep; the group signal has to end both
        let invocation =
            TaskInvocation::new("Sleeper", "/bin/sh").args(["-c", "sleep 30 & wait"]);
        let env = crate::environment::prepare_environment(&HashMap::new(), PathPolicy::Prepend);
        let mut child = spawn_task(&invocation, &env, None).expect("spawn sh");
        signal_group(&child, Signal::SIGTERM).expect("signal");
        let status = child.wait().await.expect("wait");
        assert!(!status.success());
    }
}
