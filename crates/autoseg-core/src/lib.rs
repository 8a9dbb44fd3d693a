//! # autoseg-core
//!
//! Supervisor for a single auto-segmentation batch job.
//!
//! A job turns one uploaded image series into a segmentation artifact. The
//! heavy lifting happens in an external worker process; this crate prepares
//! the environment for it, feeds it input, and watches for the observable
//! side effects that prove each phase finished:
//!
//! 1. [`params`]: collect and validate the job parameters
//! 2. [`bootstrap`]: migrate the status database, reset the output
//!    directory, link the model registry
//! 3. [`process`]: launch the worker and check it survives startup
//! 4. [`acquire`]: download, extract, and hand the input to the worker
//! 5. [`phase`]: bounded waits for the worker log, the series status, and
//!    the output artifact
//! 6. [`publish`]: upload the artifact and verify the remote copy
//!
//! [`job::JobRunner`] runs the steps in order and [`cleanup`] always runs
//! afterwards. Every failure is a [`JobError`] and ends the job.

pub mod acquire;
pub mod bootstrap;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod job;
pub mod log;
pub mod params;
pub mod phase;
pub mod process;
pub mod publish;
pub mod storage;

pub use config::SupervisorConfig;
pub use error::JobError;
pub use job::{JobPhase, JobReport, JobRunner};
pub use params::JobParameters;
