//! Object store backed by a local directory tree.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{ObjectStore, ObjectUri, StorageError};

/// Maps `scheme://bucket/key` onto `<root>/bucket/key`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Create a store rooted at `root`.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Filesystem path for `uri`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidKey` if the bucket or key would escape
    /// the root.
    pub fn path_for(&self, uri: &ObjectUri) -> Result<PathBuf, StorageError> {
        let relative = Path::new(uri.bucket()).join(uri.key());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || uri.key().is_empty() {
            return Err(StorageError::InvalidKey(uri.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

async fn copy_file(src: &Path, dest: &Path) -> Result<(), StorageError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::Io {
                context: format!("create {}", parent.display()),
                source,
            })?;
    }
    tokio::fs::copy(src, dest)
        .await
        .map_err(|source| StorageError::Io {
            context: format!("copy {} to {}", src.display(), dest.display()),
            source,
        })?;
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn fetch(&self, uri: &ObjectUri, dest: &Path) -> Result<(), StorageError> {
        let src = self.path_for(uri)?;
        debug!(%uri, src = %src.display(), dest = %dest.display(), "local fetch");
        copy_file(&src, dest).await
    }

    async fn put(&self, src: &Path, uri: &ObjectUri) -> Result<(), StorageError> {
        let dest = self.path_for(uri)?;
        debug!(%uri, src = %src.display(), dest = %dest.display(), "local put");
        copy_file(src, &dest).await
    }

    async fn exists(&self, uri: &ObjectUri) -> Result<bool, StorageError> {
        let path = self.path_for(uri)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io {
                context: format!("stat {}", path.display()),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_exists_fetch() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(root.path().to_path_buf());
        let uri = ObjectUri::parse("gs://results/rt/out.dcm").unwrap();

        assert!(!store.exists(&uri).await.unwrap());

        let src = work.path().join("out.dcm");
        std::fs::write(&src, b"DICM").unwrap();
        store.put(&src, &uri).await.unwrap();
        assert!(store.exists(&uri).await.unwrap());
        assert!(root.path().join("results/rt/out.dcm").is_file());

        let back = work.path().join("back.dcm");
        store.fetch(&uri, &back).await.unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"DICM");
    }

    #[tokio::test]
    async fn test_fetch_missing_object_fails() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(root.path().to_path_buf());
        let uri = ObjectUri::parse("gs://uploads/none.zip").unwrap();
        let err = store
            .fetch(&uri, &root.path().join("x.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let store = LocalObjectStore::new(PathBuf::from("/srv/objects"));
        let uri = ObjectUri::parse("gs://b/../../etc/passwd").unwrap();
        assert!(matches!(
            store.path_for(&uri),
            Err(StorageError::InvalidKey(_))
        ));
        let bucket_only = ObjectUri::parse("gs://b").unwrap();
        assert!(store.path_for(&bucket_only).is_err());
    }
}
