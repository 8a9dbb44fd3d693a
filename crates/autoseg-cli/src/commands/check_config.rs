//! `autoseg check-config`

use std::path::Path;

use anyhow::{Context, Result};
use autoseg_core::SupervisorConfig;

/// Load and validate the configuration, then print it with defaults filled in.
pub fn run(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        tracing::warn!(path = %config_path.display(), "config file not found, using defaults");
    }
    let config = SupervisorConfig::from_file_or_default(config_path)
        .with_context(|| format!("invalid configuration {}", config_path.display()))?;
    let rendered = config
        .to_toml()
        .context("failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}
