//! Pipeline fixture shared by the integration test binaries.
//!
//! Builds a throwaway pipeline root with a status database, a model
//! registry, a local object store, and a shell-script worker.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use autoseg_core::config::{CommandConfig, StorageConfig};
use autoseg_core::{JobReport, JobRunner, SupervisorConfig};
use rusqlite::{Connection, params};
use tempfile::TempDir;

pub const UPLOAD_ID: &str = "up_42";
pub const TOKEN: &str = "job-token-0123456789";

pub struct Fixture {
    pub dir: TempDir,
    pub config: SupervisorConfig,
}

impl Fixture {
    pub fn new(worker_script: &str, models: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pipeline");
        std::fs::create_dir_all(&root).unwrap();

        let mut config = SupervisorConfig::default();
        let paths = &mut config.paths;
        paths.pipeline_root.clone_from(&root);
        paths.watch_dir = root.join("input");
        paths.output_dir = root.join("output");
        paths.log_dir = root.join("logs");
        paths.download_dir = dir.path().join("download");
        paths.database = root.join("data/autoseg.db");
        paths.models_link = root.join("models");
        paths.models_source = dir.path().join("registry");

        std::fs::create_dir_all(&paths.models_source).unwrap();
        for i in 0..models {
            std::fs::create_dir(paths.models_source.join(format!("model_{i}"))).unwrap();
        }

        seed_database(&paths.database);

        let script = dir.path().join("worker.sh");
        std::fs::write(&script, worker_script).unwrap();
        config.worker.program = "sh".to_string();
        config.worker.args = vec![script.display().to_string()];
        config.worker.startup_grace = Duration::from_millis(300);
        config.worker.stop_grace = Duration::from_secs(1);
        config.worker.env.extend([
            ("WATCH_DIR".to_string(), paths.watch_dir.display().to_string()),
            ("OUTPUT_DIR".to_string(), paths.output_dir.display().to_string()),
            (
                "PROGRESS_LOG".to_string(),
                paths.worker_log_path().display().to_string(),
            ),
        ]);

        config.migration = CommandConfig {
            program: "true".to_string(),
            args: Vec::new(),
        };
        // Stands in for unzip: the "archive" becomes one staged slice.
        config.extractor = CommandConfig {
            program: "sh".to_string(),
            args: [
                "-c",
                "mkdir -p \"$2\" && cp \"$1\" \"$2/slice_001.dcm\"",
                "extract",
                "{archive}",
                "{dest}",
            ]
            .map(String::from)
            .to_vec(),
        };

        let remote = dir.path().join("remote");
        std::fs::create_dir_all(remote.join("uploads/batch")).unwrap();
        std::fs::write(remote.join("uploads/batch/series.zip"), b"PK-fake-archive").unwrap();
        config.storage = StorageConfig::Local { root: remote };

        config.waits.log_interval = Duration::from_millis(50);
        config.waits.log_attempts = 100;
        config.waits.db_interval = Duration::from_millis(50);
        config.waits.db_attempts = 20;
        config.waits.output_timeout = Duration::from_secs(20);
        config.waits.output_poll_interval = Duration::from_millis(200);
        config.waits.settle_delay = Duration::from_millis(50);
        config.waits.job_timeout = Duration::from_secs(60);

        config.validate().unwrap();
        Self { dir, config }
    }

    pub fn env(&self) -> HashMap<String, String> {
        HashMap::from(
            [
                ("INPUT_LOCATION", "gs://uploads/batch/series.zip"),
                ("OUTPUT_LOCATION", "gs://results/rt"),
                ("SERIES_ID", "1.2.3"),
                ("STUDY_ID", "1.2"),
                ("PATIENT_ID", "P-001"),
                ("AUTH_TOKEN", TOKEN),
                ("FILE_UPLOAD_ID", UPLOAD_ID),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    pub async fn run(&self) -> JobReport {
        let env = self.env();
        JobRunner::new(self.config.clone())
            .run(&[], |key| env.get(key).cloned())
            .await
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn archive(&self) -> PathBuf {
        self.config
            .paths
            .download_dir
            .join(format!("{UPLOAD_ID}.zip"))
    }

    pub fn capture_log(&self) -> PathBuf {
        self.config
            .paths
            .log_dir
            .join(format!("worker-{UPLOAD_ID}.log"))
    }
}

/// The worker's status row already shows the series as registered.
fn seed_database(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE series (series_name TEXT PRIMARY KEY, status TEXT);")
        .unwrap();
    conn.execute(
        "INSERT INTO series (series_name, status) VALUES (?1, ?2)",
        params!["1.2.3", "initialized"],
    )
    .unwrap();
}
