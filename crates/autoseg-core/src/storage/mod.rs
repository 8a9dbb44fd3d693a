//! Object storage.
//!
//! The supervisor consumes three operations from object storage: fetch an
//! object to a local path, put a local file to an object, and check that an
//! object exists. Locations are `scheme://bucket/key` URIs.

mod command;
mod local;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
pub use command::CommandObjectStore;
pub use local::LocalObjectStore;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::config::StorageConfig;

/// A parsed `scheme://bucket/key` location. The key may be empty for a
/// bucket-level prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    scheme: String,
    bucket: String,
    key: String,
}

impl ObjectUri {
    /// Parse a location, returning `None` if it is not of the form
    /// `scheme://bucket[/key]`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (scheme, rest) = raw.split_once("://")?;
        let scheme_ok = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !scheme_ok {
            return None;
        }
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() || bucket.chars().any(char::is_whitespace) {
            return None;
        }
        Some(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.trim_matches('/').to_string(),
        })
    }

    /// URI scheme, e.g. `gs`.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key without leading or trailing slashes.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A child location under this one.
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        let key = if self.key.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.key)
        };
        Self {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key,
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}://{}", self.scheme, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
        }
    }
}

/// Object storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A storage command could not be started.
    #[error("cannot run {program}: {source}")]
    Spawn {
        /// Program.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A storage command exited unsuccessfully.
    #[error("{program} exited with {status}: {output}")]
    CommandFailed {
        /// Program.
        program: String,
        /// Rendered exit status.
        status: String,
        /// Output tail.
        output: String,
    },

    /// Local filesystem error.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The key cannot be mapped safely.
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
}

/// The object storage operations a job consumes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download `uri` to `dest`, replacing any existing file.
    async fn fetch(&self, uri: &ObjectUri, dest: &Path) -> Result<(), StorageError>;

    /// Upload `src` to `uri`.
    async fn put(&self, src: &Path, uri: &ObjectUri) -> Result<(), StorageError>;

    /// Whether `uri` currently exists.
    async fn exists(&self, uri: &ObjectUri) -> Result<bool, StorageError>;
}

/// Build the configured store. The token is only handed to backends that
/// authenticate.
#[must_use]
pub fn build_store(config: &StorageConfig, token: &SecretString) -> Box<dyn ObjectStore> {
    match config {
        StorageConfig::Command {
            fetch,
            put,
            exists,
            token_env,
        } => Box::new(CommandObjectStore::new(
            fetch.clone(),
            put.clone(),
            exists.clone(),
            token_env
                .clone()
                .map(|name| (name, SecretString::from(token.expose_secret().to_string()))),
        )),
        StorageConfig::Local { root } => Box::new(LocalObjectStore::new(root.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        let uri = ObjectUri::parse("gs://bucket/a/b/c.zip").unwrap();
        assert_eq!(uri.scheme(), "gs");
        assert_eq!(uri.bucket(), "bucket");
        assert_eq!(uri.key(), "a/b/c.zip");
        assert_eq!(uri.to_string(), "gs://bucket/a/b/c.zip");
    }

    #[test]
    fn test_parse_bucket_only() {
        let uri = ObjectUri::parse("s3://results/").unwrap();
        assert_eq!(uri.key(), "");
        assert_eq!(uri.to_string(), "s3://results");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "bucket/key", "://bucket/key", "gs://", "gs:///key", "g s://b/k"] {
            assert!(ObjectUri::parse(bad).is_none(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_join() {
        let prefix = ObjectUri::parse("gs://results/rt/").unwrap();
        assert_eq!(
            prefix.join("AUTOSEGMENT.RT.x.dcm").to_string(),
            "gs://results/rt/AUTOSEGMENT.RT.x.dcm"
        );
        let bucket = ObjectUri::parse("gs://results").unwrap();
        assert_eq!(bucket.join("f").to_string(), "gs://results/f");
    }
}
