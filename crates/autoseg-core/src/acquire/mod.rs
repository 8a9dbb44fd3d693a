//! Input acquisition.
//!
//! Downloads the job's archive, extracts it into a job-scoped staging
//! directory, and moves the extracted files into the worker's watch
//! directory. Nothing here is retried: a missing or corrupt archive does not
//! repair itself, so failures are reported on the spot.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::config::{CommandConfig, RelocationConfig};
use crate::error::JobError;
use crate::params::{JobParameters, UploadId};
use crate::process::tool::{render_args, run_tool};
use crate::storage::ObjectStore;

/// Local archive path for an upload.
#[must_use]
pub fn archive_path(download_dir: &Path, upload_id: &UploadId) -> PathBuf {
    download_dir.join(format!("{upload_id}.zip"))
}

/// Staging directory the archive is extracted into.
#[must_use]
pub fn staging_dir(download_dir: &Path, upload_id: &UploadId) -> PathBuf {
    download_dir.join(upload_id.as_str())
}

/// Settings for one acquisition.
#[derive(Debug, Clone, Copy)]
pub struct AcquireSettings<'a> {
    /// Job-scoped download area.
    pub download_dir: &'a Path,
    /// Worker watch directory.
    pub watch_dir: &'a Path,
    /// Archive extractor invocation.
    pub extractor: &'a CommandConfig,
    /// Which staged files to move.
    pub relocation: &'a RelocationConfig,
}

/// Fetch, extract, and relocate the job input.
///
/// Returns the paths of the files placed in the watch directory.
///
/// # Errors
///
/// `DownloadFailed`, `EmptyOrMissingInput`, `ExtractionFailed`, or
/// `RelocationFailed`, in pipeline order.
pub async fn acquire_input(
    store: &dyn ObjectStore,
    params: &JobParameters,
    settings: AcquireSettings<'_>,
) -> Result<Vec<PathBuf>, JobError> {
    let archive = archive_path(settings.download_dir, params.upload_id());
    let staging = staging_dir(settings.download_dir, params.upload_id());
    clear_path(&archive)?;
    clear_path(&staging)?;

    let uri = params.input_location();
    info!(%uri, archive = %archive.display(), "downloading input");
    store
        .fetch(uri, &archive)
        .await
        .map_err(|e| JobError::DownloadFailed {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;

    match std::fs::metadata(&archive) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {
            debug!(bytes = meta.len(), "input archive downloaded");
        },
        _ => return Err(JobError::EmptyOrMissingInput { path: archive }),
    }

    extract(&archive, &staging, settings.extractor).await?;

    let moved = relocate(&staging, settings.watch_dir, settings.relocation)?;
    if moved.is_empty() {
        warn!(staging = %staging.display(), "archive yielded no input files");
        return Err(JobError::EmptyOrMissingInput { path: staging });
    }
    info!(
        files = moved.len(),
        watch_dir = %settings.watch_dir.display(),
        "input placed in watch directory"
    );
    Ok(moved)
}

/// Run the extractor on `archive` into `dest`.
///
/// # Errors
///
/// Returns `JobError::ExtractionFailed` if the extractor cannot be started
/// or exits non-zero.
pub async fn extract(archive: &Path, dest: &Path, extractor: &CommandConfig) -> Result<(), JobError> {
    std::fs::create_dir_all(dest)
        .map_err(|e| JobError::io(format!("create {}", dest.display()), e))?;

    let archive_arg = archive.display().to_string();
    let dest_arg = dest.display().to_string();
    let args = render_args(
        &extractor.args,
        &[("archive", &archive_arg), ("dest", &dest_arg)],
    );
    let failed = |status: String, output: String| JobError::ExtractionFailed {
        archive: archive.to_path_buf(),
        status,
        output,
    };

    let out = run_tool(&extractor.program, &args, None, &[])
        .await
        .map_err(|e| failed("not started".to_string(), e.to_string()))?;
    if !out.success() {
        return Err(failed(out.status_text(), out.output));
    }
    Ok(())
}

/// Move every accepted regular file under `staging` into `watch_dir`.
///
/// Nested directories are flattened. Symlinks are skipped. Files whose names
/// repeat across staged subdirectories are renamed after their staged path,
/// so `0002/IM0001` lands as `0002_IM0001`.
///
/// Every destination is decided before the first move; a name that still
/// collides, inside the plan or with an entry already in `watch_dir`, fails
/// the call with nothing moved.
///
/// # Errors
///
/// Returns `JobError::RelocationFailed` naming the first file that could not
/// be placed.
pub fn relocate(
    staging: &Path,
    watch_dir: &Path,
    filter: &RelocationConfig,
) -> Result<Vec<PathBuf>, JobError> {
    let mut files = Vec::new();
    collect_files(staging, &mut files)
        .map_err(|e| JobError::io(format!("scan {}", staging.display()), e))?;
    files.retain(|f| filter.accepts(f));
    files.sort();

    let plan = plan_moves(staging, watch_dir, files)?;

    let mut moved = Vec::with_capacity(plan.len());
    for (file, dest) in plan {
        move_file(&file, &dest).map_err(|e| JobError::RelocationFailed {
            file: file.clone(),
            reason: e.to_string(),
        })?;
        moved.push(dest);
    }
    Ok(moved)
}

/// Pair each staged file with its watch directory destination.
fn plan_moves(
    staging: &Path,
    watch_dir: &Path,
    files: Vec<PathBuf>,
) -> Result<Vec<(PathBuf, PathBuf)>, JobError> {
    let mut name_counts: HashMap<OsString, usize> = HashMap::new();
    for file in &files {
        if let Some(name) = file.file_name() {
            *name_counts.entry(name.to_os_string()).or_default() += 1;
        }
    }

    let mut taken = HashSet::new();
    let mut plan = Vec::with_capacity(files.len());
    for file in files {
        let failed = |reason: String| JobError::RelocationFailed {
            file: file.clone(),
            reason,
        };
        let Some(name) = file.file_name() else {
            continue;
        };
        let flat_name = if name_counts.get(name).copied().unwrap_or(0) > 1 {
            flattened_name(staging, &file)
        } else {
            name.to_os_string()
        };
        let dest = watch_dir.join(&flat_name);
        if !taken.insert(flat_name) {
            return Err(failed(format!(
                "{} is claimed by another staged file",
                dest.display()
            )));
        }
        if std::fs::symlink_metadata(&dest).is_ok() {
            return Err(failed(format!("{} already exists", dest.display())));
        }
        plan.push((file, dest));
    }
    debug!(files = plan.len(), "relocation planned");
    Ok(plan)
}

/// `a/b/IM0001` under `staging` becomes `a_b_IM0001`.
fn flattened_name(staging: &Path, file: &Path) -> OsString {
    let relative = file.strip_prefix(staging).unwrap_or(file);
    let mut flat = OsString::new();
    for part in relative {
        if !flat.is_empty() {
            flat.push("_");
        }
        flat.push(part);
    }
    flat
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// Rename, falling back to copy-and-delete across filesystems.
fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(Errno::EXDEV as i32) => {
            std::fs::copy(src, dest)?;
            std::fs::remove_file(src)
        },
        Err(err) => Err(err),
    }
}

/// Remove a stale file or directory left by an earlier run.
pub(crate) fn clear_path(path: &Path) -> Result<(), JobError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
    .map_err(|e| JobError::io(format!("remove {}", path.display()), e))
}
