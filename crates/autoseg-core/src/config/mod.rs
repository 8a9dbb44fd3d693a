//! Configuration parsing and management.
//!
//! This module handles parsing of the supervisor configuration file (TOML)
//! that fixes the filesystem layout, the external tool invocations, the
//! status database shape, the object storage backend, and the wait budgets.
//! Every field has a default, so a missing file yields a usable
//! configuration for the standard container layout.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SQL_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("invalid identifier pattern"));

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Filesystem layout.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Worker launch settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Schema-migration tool invocation.
    #[serde(default = "default_migration")]
    pub migration: CommandConfig,

    /// Archive extractor invocation.
    #[serde(default = "default_extractor")]
    pub extractor: CommandConfig,

    /// Which staged files are moved into the watch directory.
    #[serde(default)]
    pub relocation: RelocationConfig,

    /// Shape of the job status table.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Object storage backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Bounded wait budgets.
    #[serde(default)]
    pub waits: WaitsConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            worker: WorkerConfig::default(),
            migration: default_migration(),
            extractor: default_extractor(),
            relocation: RelocationConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            waits: WaitsConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from `path` if it exists, otherwise use defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read, parsed, or
    /// validated.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "worker.program must not be empty".to_string(),
            ));
        }
        if self.migration.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "migration.program must not be empty".to_string(),
            ));
        }
        if self.extractor.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "extractor.program must not be empty".to_string(),
            ));
        }

        for (field, value) in [
            ("database.table", &self.database.table),
            ("database.series_column", &self.database.series_column),
            ("database.status_column", &self.database.status_column),
        ] {
            if !SQL_IDENTIFIER.is_match(value) {
                return Err(ConfigError::Validation(format!(
                    "{field} must be a plain SQL identifier, got {value:?}"
                )));
            }
        }

        if self.waits.log_attempts == 0 || self.waits.db_attempts == 0 {
            return Err(ConfigError::Validation(
                "waits.log_attempts and waits.db_attempts must be at least 1".to_string(),
            ));
        }

        let name = &self.paths.artifact_name;
        let mut components = Path::new(name).components();
        let bare = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !bare || name.contains('/') {
            return Err(ConfigError::Validation(format!(
                "paths.artifact_name must be a bare file name, got {name:?}"
            )));
        }

        if let StorageConfig::Command {
            fetch, put, exists, ..
        } = &self.storage
        {
            for (field, argv) in [
                ("storage.fetch", fetch),
                ("storage.put", put),
                ("storage.exists", exists),
            ] {
                if argv.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "{field} must name a program"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Fixed filesystem layout shared with the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Working directory of the worker and the migration tool.
    #[serde(default = "default_pipeline_root")]
    pub pipeline_root: PathBuf,

    /// Directory the worker watches for new input files.
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,

    /// Directory the worker writes the artifact into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Directory holding the worker's own log and the captured output log.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Job-scoped download and staging area.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Status database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Local path that is (re)linked to the model registry.
    #[serde(default = "default_models_link")]
    pub models_link: PathBuf,

    /// Externally mounted model registry directory.
    #[serde(default = "default_models_source")]
    pub models_source: PathBuf,

    /// Well-known artifact file name inside `output_dir`.
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,

    /// File name of the worker's own progress log inside `log_dir`.
    #[serde(default = "default_worker_log_name")]
    pub worker_log_name: String,
}

fn default_pipeline_root() -> PathBuf {
    PathBuf::from("/pipeline")
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("/pipeline/input")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/pipeline/output")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/pipeline/logs")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/tmp/autoseg")
}

fn default_database() -> PathBuf {
    PathBuf::from("/pipeline/data/autoseg.db")
}

fn default_models_link() -> PathBuf {
    PathBuf::from("/pipeline/models")
}

fn default_models_source() -> PathBuf {
    PathBuf::from("/mnt/models")
}

fn default_artifact_name() -> String {
    "AUTOSEGMENT.RT.dcm".to_string()
}

fn default_worker_log_name() -> String {
    "autoseg.log".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            pipeline_root: default_pipeline_root(),
            watch_dir: default_watch_dir(),
            output_dir: default_output_dir(),
            log_dir: default_log_dir(),
            download_dir: default_download_dir(),
            database: default_database(),
            models_link: default_models_link(),
            models_source: default_models_source(),
            artifact_name: default_artifact_name(),
            worker_log_name: default_worker_log_name(),
        }
    }
}

impl PathsConfig {
    /// Local path of the final artifact.
    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(&self.artifact_name)
    }

    /// Path of the worker's own progress log.
    #[must_use]
    pub fn worker_log_path(&self) -> PathBuf {
        self.log_dir.join(&self.worker_log_name)
    }
}

/// Worker launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Program to execute.
    #[serde(default = "default_worker_program")]
    pub program: String,

    /// Arguments passed to the program.
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,

    /// Grace period between launch and the single liveness check.
    #[serde(default = "default_startup_grace")]
    #[serde(with = "humantime_serde")]
    pub startup_grace: Duration,

    /// How long cleanup waits after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_stop_grace")]
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Extra environment variables for the worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_worker_program() -> String {
    "python".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["-m".to_string(), "autoseg.worker".to_string()]
}

const fn default_startup_grace() -> Duration {
    Duration::from_secs(5)
}

const fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: default_worker_args(),
            startup_grace: default_startup_grace(),
            stop_grace: default_stop_grace(),
            env: BTreeMap::new(),
        }
    }
}

/// A single external tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    /// Program to execute (bare name resolved on `PATH`, or a path).
    pub program: String,

    /// Arguments; `{archive}` and `{dest}` are substituted for the extractor.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_migration() -> CommandConfig {
    CommandConfig {
        program: "alembic".to_string(),
        args: vec!["upgrade".to_string(), "head".to_string()],
    }
}

fn default_extractor() -> CommandConfig {
    CommandConfig {
        program: "unzip".to_string(),
        args: vec![
            "-o".to_string(),
            "-q".to_string(),
            "{archive}".to_string(),
            "-d".to_string(),
            "{dest}".to_string(),
        ],
    }
}

/// Which staged files are moved into the watch directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RelocationConfig {
    /// Case-insensitive extensions (without the dot) to move. Empty moves
    /// every regular file.
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl RelocationConfig {
    /// Whether `path` should be moved into the watch directory.
    #[must_use]
    pub fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
    }
}

/// Shape of the job status table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Table holding one row per series.
    #[serde(default = "default_table")]
    pub table: String,

    /// Column holding the series identifier.
    #[serde(default = "default_series_column")]
    pub series_column: String,

    /// Column holding the job status.
    #[serde(default = "default_status_column")]
    pub status_column: String,

    /// Status that proves the worker registered the series.
    #[serde(default = "default_expected_status")]
    pub expected_status: String,
}

fn default_table() -> String {
    "series".to_string()
}

fn default_series_column() -> String {
    "series_name".to_string()
}

fn default_status_column() -> String {
    "status".to_string()
}

fn default_expected_status() -> String {
    "initialized".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            series_column: default_series_column(),
            status_column: default_status_column(),
            expected_status: default_expected_status(),
        }
    }
}

/// Object storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Shell out to a storage CLI.
    Command {
        /// Fetch argv; `{src}` is the remote URI, `{dest}` the local path.
        #[serde(default = "default_fetch_argv")]
        fetch: Vec<String>,

        /// Put argv; `{src}` is the local path, `{dest}` the remote URI.
        #[serde(default = "default_put_argv")]
        put: Vec<String>,

        /// Existence argv; `{uri}` is the remote URI. Exit 0 means present,
        /// exit 1 means absent.
        #[serde(default = "default_exists_argv")]
        exists: Vec<String>,

        /// Environment variable through which the job token is handed to
        /// the storage commands.
        #[serde(default = "default_token_env", skip_serializing_if = "Option::is_none")]
        token_env: Option<String>,
    },

    /// Resolve `scheme://bucket/key` to `<root>/bucket/key` on a local mount.
    Local {
        /// Mount point standing in for the object store.
        root: PathBuf,
    },
}

fn default_fetch_argv() -> Vec<String> {
    ["gsutil", "cp", "{src}", "{dest}"]
        .map(String::from)
        .to_vec()
}

fn default_put_argv() -> Vec<String> {
    ["gsutil", "cp", "{src}", "{dest}"]
        .map(String::from)
        .to_vec()
}

fn default_exists_argv() -> Vec<String> {
    ["gsutil", "-q", "stat", "{uri}"].map(String::from).to_vec()
}

#[allow(clippy::unnecessary_wraps)] // serde default for an optional field
fn default_token_env() -> Option<String> {
    Some("AUTOSEG_STORAGE_TOKEN".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Command {
            fetch: default_fetch_argv(),
            put: default_put_argv(),
            exists: default_exists_argv(),
            token_env: default_token_env(),
        }
    }
}

/// Bounded wait budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitsConfig {
    /// Interval between checks for the worker log.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub log_interval: Duration,

    /// Maximum checks for the worker log.
    #[serde(default = "default_poll_attempts")]
    pub log_attempts: u32,

    /// Optional line the worker log must contain before it counts as ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_marker: Option<String>,

    /// Interval between status database checks.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub db_interval: Duration,

    /// Maximum status database checks.
    #[serde(default = "default_poll_attempts")]
    pub db_attempts: u32,

    /// Overall budget for the artifact to appear.
    #[serde(default = "default_output_timeout")]
    #[serde(with = "humantime_serde")]
    pub output_timeout: Duration,

    /// Re-check interval for the artifact wait when filesystem events are
    /// unavailable or may have been missed.
    #[serde(default = "default_output_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub output_poll_interval: Duration,

    /// Delay after the artifact appears before it is validated.
    #[serde(default = "default_settle_delay")]
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,

    /// Upper bound on the whole job.
    #[serde(default = "default_job_timeout")]
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,

    /// Lines of captured worker output attached to diagnostics.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_poll_attempts() -> u32 {
    30
}

const fn default_output_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

const fn default_output_poll_interval() -> Duration {
    Duration::from_secs(15)
}

const fn default_settle_delay() -> Duration {
    Duration::from_secs(5)
}

const fn default_job_timeout() -> Duration {
    Duration::from_secs(45 * 60)
}

const fn default_log_tail_lines() -> usize {
    50
}

impl Default for WaitsConfig {
    fn default() -> Self {
        Self {
            log_interval: default_poll_interval(),
            log_attempts: default_poll_attempts(),
            ready_marker: None,
            db_interval: default_poll_interval(),
            db_attempts: default_poll_attempts(),
            output_timeout: default_output_timeout(),
            output_poll_interval: default_output_poll_interval(),
            settle_delay: default_settle_delay(),
            job_timeout: default_job_timeout(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SupervisorConfig::from_toml("").unwrap();
        assert_eq!(config.paths.artifact_name, "AUTOSEGMENT.RT.dcm");
        assert_eq!(config.database.expected_status, "initialized");
        assert_eq!(config.waits.output_timeout, Duration::from_secs(1200));
        // log and db waits are each roughly five minutes
        assert_eq!(
            config.waits.log_interval * config.waits.log_attempts,
            Duration::from_secs(300)
        );
        assert!(matches!(config.storage, StorageConfig::Command { .. }));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [paths]
            watch_dir = "/srv/watch"
            artifact_name = "OUT.dcm"

            [worker]
            program = "/opt/worker/run.sh"
            args = ["--serve"]
            startup_grace = "2s"

            [worker.env]
            CUDA_VISIBLE_DEVICES = "0"

            [migration]
            program = "/usr/bin/true"

            [relocation]
            extensions = ["dcm"]

            [database]
            table = "dicom_series"
            expected_status = "ready"

            [storage]
            backend = "local"
            root = "/mnt/buckets"

            [waits]
            db_interval = "500ms"
            db_attempts = 4
            output_timeout = "2m"
            ready_marker = "READY"
        "#;

        let config = SupervisorConfig::from_toml(toml).unwrap();
        assert_eq!(config.paths.watch_dir, PathBuf::from("/srv/watch"));
        assert_eq!(
            config.paths.artifact_path(),
            PathBuf::from("/pipeline/output/OUT.dcm")
        );
        assert_eq!(config.worker.startup_grace, Duration::from_secs(2));
        assert_eq!(config.worker.env.get("CUDA_VISIBLE_DEVICES").unwrap(), "0");
        assert!(config.migration.args.is_empty());
        assert_eq!(config.database.table, "dicom_series");
        assert_eq!(config.database.series_column, "series_name");
        assert_eq!(config.waits.db_interval, Duration::from_millis(500));
        assert_eq!(config.waits.ready_marker.as_deref(), Some("READY"));
        match config.storage {
            StorageConfig::Local { root } => assert_eq!(root, PathBuf::from("/mnt/buckets")),
            other => panic!("expected local storage, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unsafe_sql_identifier() {
        let toml = r#"
            [database]
            table = "series; DROP TABLE series"
        "#;
        let err = SupervisorConfig::from_toml(toml).unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("database.table")),
            other => panic!("Expected ConfigError::Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let err = SupervisorConfig::from_toml("[waits]\nlog_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_artifact_name_must_be_a_plain_file_name() {
        for name in ["", ".", "..", "a/b", "/abs", "out/"] {
            let toml = format!("[paths]\nartifact_name = {name:?}\n");
            let err = SupervisorConfig::from_toml(&toml).unwrap_err();
            match err {
                ConfigError::Validation(msg) => assert!(msg.contains("artifact_name"), "{msg}"),
                other => panic!("{name:?}: expected ConfigError::Validation, got {other:?}"),
            }
        }
        let config = SupervisorConfig::from_toml("[paths]\nartifact_name = \"..RT.dcm\"\n").unwrap();
        assert_eq!(config.paths.artifact_name, "..RT.dcm");
    }

    #[test]
    fn test_toml_roundtrip_preserves_durations() {
        let config = SupervisorConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("20m"));
        let reparsed = SupervisorConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.waits.output_timeout, config.waits.output_timeout);
    }

    #[test]
    fn test_relocation_filter() {
        let all = RelocationConfig::default();
        assert!(all.accepts(Path::new("a/b/IM0001")));

        let dcm_only = RelocationConfig {
            extensions: vec![".DCM".to_string()],
        };
        assert!(dcm_only.accepts(Path::new("x/IM0001.dcm")));
        assert!(!dcm_only.accepts(Path::new("x/README.txt")));
        assert!(!dcm_only.accepts(Path::new("x/IM0001")));
    }
}
