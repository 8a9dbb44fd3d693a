//! End-of-job cleanup.
//!
//! Runs on every exit path once the job future has finished or been
//! abandoned. Nothing in here can change the exit code: each step logs its
//! own failure and moves on.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::acquire::clear_path;
use crate::process::WorkerHandle;

/// Everything a job may leave behind.
#[derive(Debug, Default)]
pub struct CleanupScope {
    /// The worker, if it was launched.
    pub worker: Option<WorkerHandle>,
    /// Job-scoped scratch paths (archive, staging directory).
    pub scratch: Vec<PathBuf>,
}

/// Stop the worker, remove scratch state, and report `exit_code`.
///
/// Returns `exit_code` unchanged.
pub async fn run_cleanup(scope: &mut CleanupScope, stop_grace: Duration, exit_code: i32) -> i32 {
    if let Some(worker) = scope.worker.as_mut() {
        worker.terminate(stop_grace).await;
    }

    for path in scope.scratch.drain(..) {
        match clear_path(&path) {
            Ok(()) => info!(path = %path.display(), "removed job scratch"),
            Err(err) => warn!(error = %err, "cleanup could not remove scratch"),
        }
    }

    if exit_code == 0 {
        info!(exit_code, "job finished");
    } else {
        error!(exit_code, "job finished");
    }
    exit_code
}
