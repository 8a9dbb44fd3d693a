//! Worker spawning and termination.
//!
//! The worker becomes the leader of a fresh process group so that cleanup
//! can reach anything it forks without signalling the supervisor itself.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{ProcessError, ProcessSpec};

/// The supervised worker: its child handle, PID, and captured log.
#[derive(Debug)]
pub struct WorkerHandle {
    child: Child,
    pid: u32,
    log_path: PathBuf,
}

impl WorkerHandle {
    /// OS process ID (also the process group ID).
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// File receiving the worker's stdout and stderr.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Non-blocking exit check. `Ok(None)` means still running.
    ///
    /// # Errors
    ///
    /// Returns the underlying wait error.
    pub fn try_exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Terminate the worker's process group.
    ///
    /// Sends SIGTERM, waits up to `grace` for the worker to exit, escalates
    /// to SIGKILL, and finally sweeps the group with SIGKILL so no forked
    /// descendant outlives the job. Never fails; problems are logged.
    pub async fn terminate(&mut self, grace: Duration) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(pid = self.pid, %status, "worker already exited");
            // A group id is not recycled while any member is still alive.
            self.signal_group(Signal::SIGKILL);
            return;
        }

        info!(pid = self.pid, "stopping worker");
        self.signal_group(Signal::SIGTERM);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(pid = self.pid, %status, "worker exited"),
            Ok(Err(err)) => warn!(pid = self.pid, error = %err, "waiting for worker failed"),
            Err(_) => {
                warn!(pid = self.pid, "worker ignored SIGTERM, sending SIGKILL");
                self.signal_group(Signal::SIGKILL);
                if let Err(err) = self.child.wait().await {
                    warn!(pid = self.pid, error = %err, "reaping worker failed");
                }
            },
        }

        self.signal_group(Signal::SIGKILL);
    }

    fn signal_group(&self, signal: Signal) {
        #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
        let group = Pid::from_raw(self.pid as i32);
        match killpg(group, signal) {
            Ok(()) | Err(Errno::ESRCH) => {},
            Err(err) => warn!(pid = self.pid, ?signal, error = %err, "signalling worker group failed"),
        }
    }
}

/// Spawn the worker with stdout and stderr appended to `log_path`.
///
/// # Errors
///
/// Returns `ProcessError::LogFile` if the log cannot be opened, or
/// `ProcessError::SpawnFailed` if the process cannot be started or its PID
/// cannot be obtained.
pub fn spawn_worker(spec: &ProcessSpec, log_path: &Path) -> Result<WorkerHandle, ProcessError> {
    let log_error = |source| ProcessError::LogFile {
        path: log_path.to_path_buf(),
        source,
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(log_error)?;
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(log_error)?;
    let stderr = stdout.try_clone().map_err(log_error)?;

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(false);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
        command: spec.command.clone(),
        reason: e.to_string(),
    })?;

    let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
        command: spec.command.clone(),
        reason: "failed to get process ID".to_string(),
    })?;

    info!(name = %spec.name, pid, log = %log_path.display(), "worker spawned");
    Ok(WorkerHandle {
        child,
        pid,
        log_path: log_path.to_path_buf(),
    })
}
