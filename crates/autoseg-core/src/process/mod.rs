//! Worker process supervision.
//!
//! The worker is launched once per job, detached into its own process group
//! with its output appended to a job-scoped log file. The supervisor checks
//! once, after a short grace period, that it is still alive; from then on it
//! only observes the worker's side effects (see [`crate::phase`]).

mod spawner;
pub mod tool;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub use spawner::{WorkerHandle, spawn_worker};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::JobError;
use crate::log::{SecretRedactor, diagnostic_tail};

/// What to run as the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Name used in logs.
    pub name: String,
    /// Program to execute.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Start building a spec.
    #[must_use]
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }
}

/// Builder for [`ProcessSpec`].
#[derive(Debug, Default)]
pub struct ProcessSpecBuilder {
    spec: ProcessSpec,
}

impl Default for ProcessSpec {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

impl ProcessSpecBuilder {
    /// Set the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = name.into();
        self
    }

    /// Set the program.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.spec.command = command.into();
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.spec.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(key.into(), value.into());
        self
    }

    /// Finish the spec.
    #[must_use]
    pub fn build(self) -> ProcessSpec {
        self.spec
    }
}

/// Errors from launching or signalling the worker.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The log file could not be prepared.
    #[error("cannot open worker log {}: {source}", path.display())]
    LogFile {
        /// Log path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The program could not be started.
    #[error("failed to spawn {command}: {reason}")]
    SpawnFailed {
        /// Program.
        command: String,
        /// Why.
        reason: String,
    },
}

/// Wait out the startup grace period, then check the worker once.
///
/// # Errors
///
/// Returns `JobError::WorkerStartupFailed` with the redacted log tail if the
/// worker has already exited or its state cannot be read.
pub async fn check_startup(
    worker: &mut WorkerHandle,
    grace: Duration,
    tail_lines: usize,
    redactor: &SecretRedactor,
) -> Result<(), JobError> {
    tokio::time::sleep(grace).await;

    let reason = match worker.try_exit_status() {
        Ok(None) => {
            info!(pid = worker.pid(), "worker alive after startup grace");
            return Ok(());
        },
        Ok(Some(status)) => format!("worker exited during startup grace: {status}"),
        Err(err) => format!("cannot inspect worker {}: {err}", worker.pid()),
    };

    let log_tail = diagnostic_tail(worker.log_path(), tail_lines, redactor);
    warn!(pid = worker.pid(), %reason, "worker startup check failed");
    Err(JobError::WorkerStartupFailed { reason, log_tail })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let spec = ProcessSpec::builder()
            .name("seg")
            .command("python")
            .args(["-m", "worker"])
            .cwd("/pipeline")
            .env("A", "1")
            .build();
        assert_eq!(spec.name, "seg");
        assert_eq!(spec.args, vec!["-m", "worker"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/pipeline")));
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_check_startup_detects_early_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("worker.log");
        let spec = ProcessSpec::builder()
            .command("sh")
            .args(["-c", "echo 'ImportError: no module named seg'; exit 2"])
            .build();

        let mut worker = spawn_worker(&spec, &log).unwrap();
        let err = check_startup(
            &mut worker,
            Duration::from_millis(300),
            10,
            &SecretRedactor::new(),
        )
        .await
        .unwrap_err();

        match err {
            JobError::WorkerStartupFailed { reason, log_tail } => {
                assert!(reason.contains("exited"));
                assert!(log_tail.contains("ImportError"));
            },
            other => panic!("expected WorkerStartupFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_startup_accepts_running_worker() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("worker.log");
        let spec = ProcessSpec::builder()
            .command("sleep")
            .args(["30"])
            .build();

        let mut worker = spawn_worker(&spec, &log).unwrap();
        check_startup(
            &mut worker,
            Duration::from_millis(100),
            10,
            &SecretRedactor::new(),
        )
        .await
        .unwrap();
        worker.terminate(Duration::from_secs(1)).await;
        assert!(worker.try_exit_status().unwrap().is_some());
    }
}
