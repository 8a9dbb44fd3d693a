//! Output publication.
//!
//! The artifact is only trusted once it is non-empty after a settle delay,
//! and the upload is only trusted once a separate existence check confirms
//! the remote object.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::JobError;
use crate::params::UploadId;
use crate::storage::{ObjectStore, ObjectUri};

/// Remote object name for an artifact: the upload id is inserted before the
/// extension (`AUTOSEGMENT.RT.dcm` becomes `AUTOSEGMENT.RT.<id>.dcm`).
#[must_use]
pub fn remote_name(artifact_name: &str, upload_id: &UploadId) -> String {
    match artifact_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{upload_id}.{ext}"),
        _ => format!("{artifact_name}.{upload_id}"),
    }
}

/// Remote destination of the artifact under the job's output location.
#[must_use]
pub fn remote_uri(output_location: &ObjectUri, artifact_name: &str, upload_id: &UploadId) -> ObjectUri {
    output_location.join(&remote_name(artifact_name, upload_id))
}

/// Size of the artifact, or `OutputMissingOrEmpty`.
fn artifact_len(artifact: &Path) -> Result<u64, JobError> {
    match std::fs::metadata(artifact) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(_) => Err(JobError::OutputMissingOrEmpty {
            path: artifact.to_path_buf(),
        }),
        Err(err) => {
            warn!(path = %artifact.display(), error = %err, "artifact unreadable");
            Err(JobError::OutputMissingOrEmpty {
                path: artifact.to_path_buf(),
            })
        },
    }
}

/// Settle, validate, upload, and verify the artifact.
///
/// Returns the remote location it was published to.
///
/// # Errors
///
/// `OutputMissingOrEmpty`, `UploadFailed`, or `UploadVerificationFailed`.
pub async fn publish(
    store: &dyn ObjectStore,
    artifact: &Path,
    destination: &ObjectUri,
    settle_delay: Duration,
) -> Result<ObjectUri, JobError> {
    if !settle_delay.is_zero() {
        info!(
            delay = %humantime::format_duration(settle_delay),
            "letting artifact writes settle"
        );
        tokio::time::sleep(settle_delay).await;
    }

    let bytes = artifact_len(artifact)?;
    info!(
        artifact = %artifact.display(),
        bytes,
        destination = %destination,
        "uploading artifact"
    );

    store
        .put(artifact, destination)
        .await
        .map_err(|err| JobError::UploadFailed {
            uri: destination.to_string(),
            reason: err.to_string(),
        })?;

    match store.exists(destination).await {
        Ok(true) => {
            info!(destination = %destination, "upload verified");
            Ok(destination.clone())
        },
        Ok(false) => Err(JobError::UploadVerificationFailed {
            uri: destination.to_string(),
            reason: "object not found after upload".to_string(),
        }),
        Err(err) => Err(JobError::UploadVerificationFailed {
            uri: destination.to_string(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::storage::{LocalObjectStore, StorageError};

    fn upload_id() -> UploadId {
        UploadId::parse("up_42").unwrap()
    }

    #[test]
    fn test_remote_name() {
        let id = upload_id();
        assert_eq!(remote_name("AUTOSEGMENT.RT.dcm", &id), "AUTOSEGMENT.RT.up_42.dcm");
        assert_eq!(remote_name("result", &id), "result.up_42");
        assert_eq!(remote_name(".hidden", &id), ".hidden.up_42");
    }

    #[tokio::test]
    async fn test_publish_to_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("AUTOSEGMENT.RT.dcm");
        std::fs::write(&artifact, b"DICM").unwrap();
        let store = LocalObjectStore::new(dir.path().join("remote"));
        let dest = remote_uri(
            &ObjectUri::parse("gs://results/rt").unwrap(),
            "AUTOSEGMENT.RT.dcm",
            &upload_id(),
        );

        let published = publish(&store, &artifact, &dest, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(published.to_string(), "gs://results/rt/AUTOSEGMENT.RT.up_42.dcm");
        let remote = dir
            .path()
            .join("remote/results/rt/AUTOSEGMENT.RT.up_42.dcm");
        assert_eq!(std::fs::read(remote).unwrap(), b"DICM");
    }

    #[tokio::test]
    async fn test_empty_artifact_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("AUTOSEGMENT.RT.dcm");
        std::fs::write(&artifact, b"").unwrap();
        let store = LocalObjectStore::new(dir.path().join("remote"));
        let dest = ObjectUri::parse("gs://results/out.dcm").unwrap();

        let err = publish(&store, &artifact, &dest, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::OutputMissingOrEmpty { .. }));

        std::fs::remove_file(&artifact).unwrap();
        let err = publish(&store, &artifact, &dest, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::OutputMissingOrEmpty { .. }));
    }

    /// Accepts uploads but never shows them.
    struct BlackHole;

    #[async_trait]
    impl ObjectStore for BlackHole {
        async fn fetch(&self, _uri: &ObjectUri, _dest: &Path) -> Result<(), StorageError> {
            Ok(())
        }

        async fn put(&self, _src: &Path, _uri: &ObjectUri) -> Result<(), StorageError> {
            Ok(())
        }

        async fn exists(&self, _uri: &ObjectUri) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_unverified_upload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("AUTOSEGMENT.RT.dcm");
        std::fs::write(&artifact, b"DICM").unwrap();
        let dest = ObjectUri::parse("gs://results/out.dcm").unwrap();

        let err = publish(&BlackHole, &artifact, &dest, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::UploadVerificationFailed { .. }));
    }

    #[tokio::test]
    async fn test_failed_put_is_upload_failure() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("AUTOSEGMENT.RT.dcm");
        std::fs::write(&artifact, b"DICM").unwrap();
        // The remote root is a file, so nothing can be written beneath it.
        let root = dir.path().join("remote");
        std::fs::write(&root, b"").unwrap();
        let store = LocalObjectStore::new(root);
        let dest = ObjectUri::parse("gs://results/out.dcm").unwrap();

        let err = publish(&store, &artifact, &dest, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::UploadFailed { .. }));
    }
}
