//! `autoseg run`

use std::path::Path;

use anyhow::{Context, Result};
use autoseg_core::{JobRunner, SupervisorConfig};

/// Run one job and return its exit code.
///
/// Only configuration and runtime setup errors are returned as `Err`; a
/// failed job is reported through the exit code.
pub fn run(config_path: &Path, pairs: &[String]) -> Result<i32> {
    let config = SupervisorConfig::from_file_or_default(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let report = runtime.block_on(
        JobRunner::new(config).run(pairs, |key| std::env::var(key).ok()),
    );
    Ok(report.exit_code)
}
