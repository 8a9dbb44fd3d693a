//! The job state machine.
//!
//! [`JobRunner::run`] drives one job from parameter validation to a verified
//! upload, strictly in order, and always finishes with cleanup. The job is
//! raced against its overall deadline and against SIGTERM/SIGINT; whichever
//! ends it decides the exit code, and cleanup reports that code unchanged.

use std::fmt;

use nix::sys::signal::Signal;
use secrecy::ExposeSecret;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::acquire::{AcquireSettings, acquire_input, archive_path, clear_path, staging_dir};
use crate::bootstrap::bootstrap;
use crate::cleanup::{CleanupScope, run_cleanup};
use crate::config::SupervisorConfig;
use crate::error::JobError;
use crate::log::SecretRedactor;
use crate::params::JobParameters;
use crate::phase::{PhaseWaitSpec, StatusQuery, wait_for_phase};
use crate::process::{ProcessSpec, check_startup, spawn_worker};
use crate::publish::{publish, remote_uri};
use crate::storage::{ObjectUri, build_store};

/// Where a job is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Collecting parameters.
    Validate,
    /// Preparing the shared environment.
    Bootstrap,
    /// Starting the worker.
    Launch,
    /// Fetching and staging input.
    Acquire,
    /// Waiting for the worker log.
    WaitLog,
    /// Waiting for the series status.
    WaitStatus,
    /// Waiting for the output artifact.
    WaitOutput,
    /// Uploading the artifact.
    Publish,
    /// Nothing left to do.
    Done,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validate => "validate",
            Self::Bootstrap => "bootstrap",
            Self::Launch => "launch",
            Self::Acquire => "acquire",
            Self::WaitLog => "wait-log",
            Self::WaitStatus => "wait-status",
            Self::WaitOutput => "wait-output",
            Self::Publish => "publish",
            Self::Done => "done",
        })
    }
}

/// How a job ended.
#[derive(Debug)]
pub struct JobReport {
    /// Process exit code.
    pub exit_code: i32,
    /// Phase the job was in when it ended.
    pub phase: JobPhase,
    /// Published location, or the error that stopped the job.
    pub result: Result<ObjectUri, JobError>,
}

/// State shared between the job and its cleanup.
#[derive(Debug)]
struct JobContext {
    phase: JobPhase,
    redactor: SecretRedactor,
    scope: CleanupScope,
}

impl JobContext {
    fn enter(&mut self, phase: JobPhase) {
        info!(%phase, "entering phase");
        self.phase = phase;
    }
}

/// Runs jobs against one configuration.
#[derive(Debug, Clone)]
pub struct JobRunner {
    config: SupervisorConfig,
}

impl JobRunner {
    /// Create a runner.
    #[must_use]
    pub const fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run one job to completion, including cleanup.
    ///
    /// `args` are `KEY VALUE` pairs; `env` resolves parameters not given on
    /// the command line.
    pub async fn run<F>(&self, args: &[String], env: F) -> JobReport
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ctx = JobContext {
            phase: JobPhase::Validate,
            redactor: SecretRedactor::new(),
            scope: CleanupScope::default(),
        };
        let limit = self.config.waits.job_timeout;

        let result = tokio::select! {
            outcome = tokio::time::timeout(limit, self.execute(&mut ctx, args, &env)) => {
                outcome.unwrap_or(Err(JobError::DeadlineExceeded { limit }))
            },
            err = interrupted() => Err(err),
        };

        let exit_code = match &result {
            Ok(uri) => {
                info!(published = %uri, "job succeeded");
                0
            },
            Err(err) => {
                let message = err.to_string();
                error!(
                    kind = err.kind(),
                    phase = %ctx.phase,
                    "job failed: {}",
                    ctx.redactor.redact(&message)
                );
                err.exit_code()
            },
        };

        let exit_code = run_cleanup(&mut ctx.scope, self.config.worker.stop_grace, exit_code).await;
        JobReport {
            exit_code,
            phase: ctx.phase,
            result,
        }
    }

    async fn execute<F>(
        &self,
        ctx: &mut JobContext,
        args: &[String],
        env: &F,
    ) -> Result<ObjectUri, JobError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = &self.config;
        let paths = &config.paths;
        let waits = &config.waits;

        ctx.enter(JobPhase::Validate);
        let params = JobParameters::from_sources(args, env)?;
        params.log_summary();
        ctx.redactor = SecretRedactor::new().with_literal(params.auth_token().expose_secret());
        ctx.scope.scratch = vec![
            archive_path(&paths.download_dir, params.upload_id()),
            staging_dir(&paths.download_dir, params.upload_id()),
        ];

        ctx.enter(JobPhase::Bootstrap);
        bootstrap(config).await?;

        ctx.enter(JobPhase::Launch);
        let progress_log = paths.worker_log_path();
        // A log left by an earlier job would satisfy the log wait at once.
        clear_path(&progress_log)?;
        let capture_log = paths
            .log_dir
            .join(format!("worker-{}.log", params.upload_id()));
        let spec = ProcessSpec::builder()
            .name("segmentation-worker")
            .command(&config.worker.program)
            .args(&config.worker.args)
            .cwd(&paths.pipeline_root);
        let spec = config
            .worker
            .env
            .iter()
            .fold(spec, |spec, (key, value)| spec.env(key, value))
            .build();
        let worker = spawn_worker(&spec, &capture_log).map_err(|err| {
            JobError::WorkerStartupFailed {
                reason: err.to_string(),
                log_tail: String::new(),
            }
        })?;
        let worker = ctx.scope.worker.insert(worker);
        check_startup(
            worker,
            config.worker.startup_grace,
            waits.log_tail_lines,
            &ctx.redactor,
        )
        .await?;

        ctx.enter(JobPhase::Acquire);
        let store = build_store(&config.storage, params.auth_token());
        let staged = acquire_input(
            store.as_ref(),
            &params,
            AcquireSettings {
                download_dir: &paths.download_dir,
                watch_dir: &paths.watch_dir,
                extractor: &config.extractor,
                relocation: &config.relocation,
            },
        )
        .await?;
        info!(files = staged.len(), "input handed to worker");

        ctx.enter(JobPhase::WaitLog);
        wait_for_phase(&PhaseWaitSpec::worker_log(
            progress_log,
            waits.ready_marker.clone(),
            waits.log_interval,
            waits.log_attempts,
        ))
        .await?;

        ctx.enter(JobPhase::WaitStatus);
        let query = StatusQuery::new(paths.database.clone(), &config.database, params.series_id());
        wait_for_phase(&PhaseWaitSpec::series_status(
            query,
            waits.db_interval,
            waits.db_attempts,
        ))
        .await?;

        ctx.enter(JobPhase::WaitOutput);
        let artifact = paths.artifact_path();
        wait_for_phase(&PhaseWaitSpec::output_artifact(
            artifact.clone(),
            waits.output_timeout,
            waits.output_poll_interval,
            capture_log,
            waits.log_tail_lines,
            ctx.redactor.clone(),
        ))
        .await?;

        ctx.enter(JobPhase::Publish);
        let destination = remote_uri(
            params.output_location(),
            &paths.artifact_name,
            params.upload_id(),
        );
        let published = publish(store.as_ref(), &artifact, &destination, waits.settle_delay).await?;

        ctx.enter(JobPhase::Done);
        Ok(published)
    }
}

/// Resolves once SIGTERM or SIGINT arrives. Never resolves if the handlers
/// cannot be installed.
async fn interrupted() -> JobError {
    let handlers = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    );
    let (Ok(mut sigterm), Ok(mut sigint)) = handlers else {
        warn!("cannot install signal handlers; the job can only end on its own");
        return std::future::pending().await;
    };

    let signal = tokio::select! {
        _ = sigterm.recv() => Signal::SIGTERM,
        _ = sigint.recv() => Signal::SIGINT,
    };
    warn!(?signal, "termination requested");
    JobError::Interrupted {
        signal: signal as i32,
    }
}
