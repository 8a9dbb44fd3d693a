//! Bounded waits for observable job milestones.
//!
//! A [`PhaseWaitSpec`] pairs a predicate over external state (a file, a log
//! line, a status row) with a strategy (fixed-interval polling, or filesystem
//! events backed by polling) and the diagnostics to capture on failure.
//! [`wait_for_phase`] is the only wait loop in the supervisor; the three call
//! sites differ only in the `PhaseWaitSpec` they build.
//!
//! Predicates are polled, not asserted: an error while sampling (a database
//! locked mid-write, a log file rotated away) counts as "not yet".

mod status_db;
mod watch;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

pub use self::status_db::{StatusDiagnosis, StatusObservation, StatusQuery};
pub use self::watch::{DirWatch, WatchEvent, watch_dir};
use crate::error::JobError;
use crate::log::{SecretRedactor, diagnostic_tail};

/// Condition that marks a phase as complete.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// A file exists at the path.
    FileExists(PathBuf),
    /// The log file exists and, when a marker is given, contains it.
    LogContains {
        /// Log file.
        path: PathBuf,
        /// Line fragment proving readiness.
        marker: Option<String>,
    },
    /// The status row for a series carries the expected status.
    DbStatus(StatusQuery),
}

/// How the predicate is re-evaluated.
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    /// Evaluate up to `max_attempts` times, sleeping `interval` in between.
    Polling {
        /// Pause between attempts.
        interval: Duration,
        /// Total evaluations before giving up.
        max_attempts: u32,
    },
    /// Subscribe to the target's directory and re-check on every matching
    /// event, and at least every `fallback_interval`, until `timeout`.
    EventDriven {
        /// Overall budget.
        timeout: Duration,
        /// Re-check period when no events arrive or none can be received.
        fallback_interval: Duration,
    },
}

/// External state captured when a wait gives up.
#[derive(Debug, Clone)]
pub enum Diagnostics {
    /// Nothing beyond the description.
    None,
    /// Dump of the status table for the queried series.
    StatusDump(StatusQuery),
    /// Redacted tail of a log file.
    LogTail {
        /// Log file.
        path: PathBuf,
        /// Number of trailing lines.
        lines: usize,
        /// Scrubs secrets from the tail.
        redactor: SecretRedactor,
    },
}

/// One bounded wait.
#[derive(Debug, Clone)]
pub struct PhaseWaitSpec {
    /// Human-readable name, used in logs and the timeout error.
    pub description: String,
    /// Completion condition.
    pub predicate: Predicate,
    /// Re-evaluation strategy.
    pub strategy: Strategy,
    /// What to capture on timeout.
    pub diagnostics: Diagnostics,
}

/// A successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Predicate evaluations, including the successful one.
    pub attempts: u32,
    /// Time from the first to the successful evaluation.
    pub elapsed: Duration,
}

/// Result of evaluating a predicate once.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Sample {
    Satisfied,
    Pending(String),
}

impl Predicate {
    fn sample(&self) -> Sample {
        match self {
            Self::FileExists(path) => {
                if path.exists() {
                    Sample::Satisfied
                } else {
                    Sample::Pending(format!("{} does not exist yet", path.display()))
                }
            },
            Self::LogContains { path, marker } => sample_log(path, marker.as_deref()),
            Self::DbStatus(query) => match query.observe() {
                Ok(StatusObservation::Reached) => Sample::Satisfied,
                Ok(StatusObservation::OtherStatus(status)) => Sample::Pending(format!(
                    "series {} has status {status:?}, waiting for {:?}",
                    query.series_id, query.expected_status
                )),
                Ok(StatusObservation::NotRegistered) => {
                    Sample::Pending(format!("series {} not registered yet", query.series_id))
                },
                Err(err) => {
                    debug!(error = %err, "status read failed");
                    Sample::Pending(format!("status database not readable: {err}"))
                },
            },
        }
    }

    /// Directory and entry name to subscribe to, for file predicates.
    fn watch_target(&self) -> Option<(&Path, OsString)> {
        let path = match self {
            Self::FileExists(path) | Self::LogContains { path, .. } => path,
            Self::DbStatus(_) => return None,
        };
        Some((path.parent()?, path.file_name()?.to_os_string()))
    }
}

fn sample_log(path: &Path, marker: Option<&str>) -> Sample {
    let Some(marker) = marker else {
        return if path.exists() {
            Sample::Satisfied
        } else {
            Sample::Pending(format!("{} does not exist yet", path.display()))
        };
    };
    match std::fs::read(path) {
        Ok(bytes) if String::from_utf8_lossy(&bytes).contains(marker) => Sample::Satisfied,
        Ok(_) => Sample::Pending(format!("{} has no {marker:?} line yet", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Sample::Pending(format!("{} does not exist yet", path.display()))
        },
        Err(err) => {
            debug!(path = %path.display(), error = %err, "log read failed");
            Sample::Pending(format!("{} not readable: {err}", path.display()))
        },
    }
}

impl Diagnostics {
    fn capture(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::StatusDump(query) => format!("status database: {}", query.diagnose()),
            Self::LogTail {
                path,
                lines,
                redactor,
            } => format!(
                "--- tail of {} ---\n{}",
                path.display(),
                diagnostic_tail(path, *lines, redactor)
            ),
        }
    }
}

impl PhaseWaitSpec {
    /// Wait for the worker's log to appear (and carry `marker`, if given).
    #[must_use]
    pub fn worker_log(
        path: PathBuf,
        marker: Option<String>,
        interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            description: "worker log".to_string(),
            predicate: Predicate::LogContains { path, marker },
            strategy: Strategy::Polling {
                interval,
                max_attempts,
            },
            diagnostics: Diagnostics::None,
        }
    }

    /// Wait for the series status row to reach the expected status.
    #[must_use]
    pub fn series_status(query: StatusQuery, interval: Duration, max_attempts: u32) -> Self {
        Self {
            description: format!("series {} status {:?}", query.series_id, query.expected_status),
            predicate: Predicate::DbStatus(query.clone()),
            strategy: Strategy::Polling {
                interval,
                max_attempts,
            },
            diagnostics: Diagnostics::StatusDump(query),
        }
    }

    /// Wait for the output artifact, reporting the worker log on timeout.
    #[must_use]
    pub fn output_artifact(
        artifact: PathBuf,
        timeout: Duration,
        fallback_interval: Duration,
        worker_log: PathBuf,
        tail_lines: usize,
        redactor: SecretRedactor,
    ) -> Self {
        Self {
            description: format!("output artifact {}", artifact.display()),
            predicate: Predicate::FileExists(artifact),
            strategy: Strategy::EventDriven {
                timeout,
                fallback_interval,
            },
            diagnostics: Diagnostics::LogTail {
                path: worker_log,
                lines: tail_lines,
                redactor,
            },
        }
    }
}

/// Tracks evaluations and logs pending state only when it changes.
struct Attempts<'a> {
    spec: &'a PhaseWaitSpec,
    count: u32,
    started: Instant,
    last_pending: Option<String>,
}

impl<'a> Attempts<'a> {
    fn new(spec: &'a PhaseWaitSpec) -> Self {
        Self {
            spec,
            count: 0,
            started: Instant::now(),
            last_pending: None,
        }
    }

    fn check(&mut self) -> Option<WaitOutcome> {
        self.count = self.count.saturating_add(1);
        match self.spec.predicate.sample() {
            Sample::Satisfied => {
                let outcome = WaitOutcome {
                    attempts: self.count,
                    elapsed: self.started.elapsed(),
                };
                info!(
                    phase = %self.spec.description,
                    attempts = outcome.attempts,
                    elapsed = %humantime::format_duration(round_millis(outcome.elapsed)),
                    "phase reached"
                );
                Some(outcome)
            },
            Sample::Pending(detail) => {
                if self.last_pending.as_deref() != Some(detail.as_str()) {
                    info!(phase = %self.spec.description, attempt = self.count, %detail, "waiting");
                    self.last_pending = Some(detail);
                }
                None
            },
        }
    }

    fn timeout(&self) -> JobError {
        let diagnostics = self.spec.diagnostics.capture();
        warn!(
            phase = %self.spec.description,
            attempts = self.count,
            "phase wait exhausted"
        );
        JobError::PhaseTimeout {
            phase: self.spec.description.clone(),
            attempts: self.count,
            diagnostics,
        }
    }
}

fn round_millis(duration: Duration) -> Duration {
    Duration::from_millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Wait until the predicate holds or the budget is spent.
///
/// # Errors
///
/// Returns `JobError::PhaseTimeout` carrying the configured diagnostics when the
/// budget is exhausted.
pub async fn wait_for_phase(spec: &PhaseWaitSpec) -> Result<WaitOutcome, JobError> {
    let mut attempts = Attempts::new(spec);
    match spec.strategy {
        Strategy::Polling {
            interval,
            max_attempts,
        } => poll(&mut attempts, interval, max_attempts.max(1)).await,
        Strategy::EventDriven {
            timeout,
            fallback_interval,
        } => watch_until(&mut attempts, timeout, fallback_interval).await,
    }
}

async fn poll(
    attempts: &mut Attempts<'_>,
    interval: Duration,
    max_attempts: u32,
) -> Result<WaitOutcome, JobError> {
    for attempt in 1..=max_attempts {
        if let Some(outcome) = attempts.check() {
            return Ok(outcome);
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(attempts.timeout())
}

async fn watch_until(
    attempts: &mut Attempts<'_>,
    timeout: Duration,
    fallback_interval: Duration,
) -> Result<WaitOutcome, JobError> {
    if let Some(outcome) = attempts.check() {
        return Ok(outcome);
    }

    let spec = attempts.spec;
    let deadline = tokio::time::Instant::now() + timeout;
    let target = spec.predicate.watch_target();
    let mut subscription = match &target {
        Some((dir, _)) => match watch_dir(dir) {
            Ok(watch) => Some(watch),
            Err(reason) => {
                warn!(phase = %spec.description, %reason, "events unavailable, polling");
                None
            },
        },
        None => None,
    };

    // The entry may have appeared between the first check and the watch.
    if subscription.is_some() {
        if let Some(outcome) = attempts.check() {
            return Ok(outcome);
        }
    }

    let tick = fallback_interval.max(Duration::from_millis(10));
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let nap = tick.min(deadline - now);
        let stream_open = match (subscription.as_mut(), &target) {
            (Some(watch), Some((_, name))) => tokio::time::timeout(nap, watch.next_for(name))
                .await
                .unwrap_or(true),
            _ => {
                tokio::time::sleep(nap).await;
                true
            },
        };
        if !stream_open {
            debug!(phase = %spec.description, "event stream ended, polling");
            subscription = None;
        }
        if let Some(outcome) = attempts.check() {
            return Ok(outcome);
        }
    }

    if let Some(outcome) = attempts.check() {
        return Ok(outcome);
    }
    Err(attempts.timeout())
}
