//! Object store that shells out to a storage CLI (`gsutil`, `aws s3`, ...).

use std::path::Path;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::{ObjectStore, ObjectUri, StorageError};
use crate::process::tool::{ToolOutput, render_args, run_tool};

/// Runs configured argv templates for each operation.
#[derive(Debug)]
pub struct CommandObjectStore {
    fetch: Vec<String>,
    put: Vec<String>,
    exists: Vec<String>,
    token: Option<(String, SecretString)>,
}

impl CommandObjectStore {
    /// Create a store from argv templates. `token` is exported to every
    /// command as the named environment variable.
    #[must_use]
    pub const fn new(
        fetch: Vec<String>,
        put: Vec<String>,
        exists: Vec<String>,
        token: Option<(String, SecretString)>,
    ) -> Self {
        Self {
            fetch,
            put,
            exists,
            token,
        }
    }

    async fn run(&self, template: &[String], vars: &[(&str, &str)]) -> Result<ToolOutput, StorageError> {
        let argv = render_args(template, vars);
        let Some((program, args)) = argv.split_first() else {
            return Err(StorageError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        let env: Vec<(String, String)> = self
            .token
            .iter()
            .map(|(name, token)| (name.clone(), token.expose_secret().to_string()))
            .collect();

        debug!(program, ?args, "storage command");
        run_tool(program, args, None, &env)
            .await
            .map_err(|source| StorageError::Spawn {
                program: program.clone(),
                source,
            })
    }

    fn require_success(template: &[String], out: ToolOutput) -> Result<(), StorageError> {
        if out.success() {
            Ok(())
        } else {
            Err(StorageError::CommandFailed {
                program: template.first().cloned().unwrap_or_default(),
                status: out.status_text(),
                output: out.output,
            })
        }
    }
}

#[async_trait]
impl ObjectStore for CommandObjectStore {
    async fn fetch(&self, uri: &ObjectUri, dest: &Path) -> Result<(), StorageError> {
        let remote = uri.to_string();
        let local = dest.display().to_string();
        let out = self
            .run(&self.fetch, &[("src", &remote), ("dest", &local)])
            .await?;
        Self::require_success(&self.fetch, out)
    }

    async fn put(&self, src: &Path, uri: &ObjectUri) -> Result<(), StorageError> {
        let remote = uri.to_string();
        let local = src.display().to_string();
        let out = self
            .run(&self.put, &[("src", &local), ("dest", &remote)])
            .await?;
        Self::require_success(&self.put, out)
    }

    async fn exists(&self, uri: &ObjectUri) -> Result<bool, StorageError> {
        let remote = uri.to_string();
        let out = self.run(&self.exists, &[("uri", &remote)]).await?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(StorageError::CommandFailed {
                program: self.exists.first().cloned().unwrap_or_default(),
                status: out.status_text(),
                output: out.output,
            }),
        }
    }
}
