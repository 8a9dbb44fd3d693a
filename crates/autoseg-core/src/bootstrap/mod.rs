//! Environment bootstrap.
//!
//! Brings the shared runtime into the state the worker expects before it is
//! launched: schema migrated, status database present, output directory
//! empty, and the model registry linked and non-empty. Each step fails fast;
//! none is retried, because a failure here means the image or the mounts are
//! wrong rather than that something is still starting up.

use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::config::{CommandConfig, SupervisorConfig};
use crate::error::JobError;
use crate::process::tool::{find_program, run_tool};

/// Mode for directories the supervisor (re)creates.
const DIR_MODE: u32 = 0o755;

/// Run every bootstrap step in order.
///
/// # Errors
///
/// Returns the first failing step's error: `ToolUnavailable`,
/// `MigrationFailed`, `DatabaseNotCreated`, `ModelRegistryMissing`,
/// `NoModelsFound`, or `Io` for directory preparation.
pub async fn bootstrap(config: &SupervisorConfig) -> Result<(), JobError> {
    let paths = &config.paths;

    let tool = ensure_tool(&config.migration.program)?;
    run_migrations(&tool, &config.migration, &paths.pipeline_root).await?;
    verify_database(&paths.database)?;

    recreate_dir(&paths.output_dir)?;
    for dir in [&paths.watch_dir, &paths.log_dir, &paths.download_dir] {
        ensure_dir(dir)?;
    }

    let models = link_model_registry(&paths.models_link, &paths.models_source)?;
    info!(
        models,
        link = %paths.models_link.display(),
        source = %paths.models_source.display(),
        "environment ready"
    );
    Ok(())
}

/// Resolve the migration tool.
///
/// # Errors
///
/// Returns `JobError::ToolUnavailable` if it cannot be found or executed.
pub fn ensure_tool(program: &str) -> Result<PathBuf, JobError> {
    find_program(program).ok_or_else(|| JobError::ToolUnavailable {
        tool: program.to_string(),
    })
}

/// Apply pending migrations to head.
///
/// # Errors
///
/// Returns `JobError::MigrationFailed` on a non-zero exit, or
/// `JobError::ToolUnavailable` if the tool cannot be started.
pub async fn run_migrations(
    tool: &Path,
    migration: &CommandConfig,
    cwd: &Path,
) -> Result<(), JobError> {
    let program = tool.display().to_string();
    let cwd = cwd.is_dir().then_some(cwd);
    let out = run_tool(&program, &migration.args, cwd, &[])
        .await
        .map_err(|_| JobError::ToolUnavailable {
            tool: migration.program.clone(),
        })?;

    if !out.success() {
        return Err(JobError::MigrationFailed {
            status: out.status_text(),
            output: out.output,
        });
    }
    info!(tool = %program, "schema migrations applied");
    Ok(())
}

/// Confirm the status database exists and can be queried.
///
/// # Errors
///
/// Returns `JobError::DatabaseNotCreated` if the file is absent or not a
/// readable database.
pub fn verify_database(path: &Path) -> Result<(), JobError> {
    let not_created = |reason: String| JobError::DatabaseNotCreated {
        path: path.to_path_buf(),
        reason,
    };

    if !path.is_file() {
        return Err(not_created("file does not exist".to_string()));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| not_created(e.to_string()))?;
    let tables: i64 = conn
        .query_row("SELECT count(*) FROM sqlite_master WHERE type = 'table'", [], |row| {
            row.get(0)
        })
        .map_err(|e| not_created(e.to_string()))?;
    debug!(path = %path.display(), tables, "database verified");
    Ok(())
}

/// Remove `dir` if present and create it again, empty. Safe to repeat.
///
/// # Errors
///
/// Returns `JobError::Io` if removal or creation fails.
pub fn recreate_dir(dir: &Path) -> Result<(), JobError> {
    match std::fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(dir),
        Ok(_) => std::fs::remove_file(dir),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
    .map_err(|e| JobError::io(format!("remove {}", dir.display()), e))?;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| JobError::io(format!("create {}", dir.display()), e))
}

fn ensure_dir(dir: &Path) -> Result<(), JobError> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| JobError::io(format!("create {}", dir.display()), e))
}

/// Count model subdirectories in the registry, ignoring hidden entries.
///
/// # Errors
///
/// Returns `JobError::ModelRegistryMissing` if `source` is not a readable
/// directory.
pub fn count_models(source: &Path) -> Result<usize, JobError> {
    let missing = || JobError::ModelRegistryMissing {
        path: source.to_path_buf(),
    };
    if !source.is_dir() {
        return Err(missing());
    }
    let entries = std::fs::read_dir(source).map_err(|_| missing())?;
    Ok(entries
        .filter_map(Result::ok)
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .filter(|entry| entry.path().is_dir())
        .count())
}

/// Point `link` at the model registry, replacing whatever is there.
///
/// Returns the number of models found.
///
/// # Errors
///
/// Returns `ModelRegistryMissing` if `source` is absent, `NoModelsFound` if
/// it holds no model subdirectories, or `Io` if the link cannot be replaced.
pub fn link_model_registry(link: &Path, source: &Path) -> Result<usize, JobError> {
    let models = count_models(source)?;
    if models == 0 {
        return Err(JobError::NoModelsFound {
            path: source.to_path_buf(),
        });
    }

    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(link),
        Ok(_) => std::fs::remove_file(link),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
    .map_err(|e| JobError::io(format!("remove {}", link.display()), e))?;

    if let Some(parent) = link.parent() {
        ensure_dir(parent)?;
    }
    std::os::unix::fs::symlink(source, link).map_err(|e| {
        JobError::io(
            format!("link {} -> {}", link.display(), source.display()),
            e,
        )
    })?;
    Ok(models)
}
