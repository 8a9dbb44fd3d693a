//! autoseg - auto-segmentation job supervisor
//!
//! Runs one segmentation job inside the prepared container runtime and exits
//! with the job's exit code.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// autoseg - auto-segmentation job supervisor
#[derive(Parser, Debug)]
#[command(name = "autoseg")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to supervisor configuration file
    #[arg(short, long, default_value = "autoseg.toml", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one job
    ///
    /// Parameters are read from the environment (INPUT_LOCATION,
    /// OUTPUT_LOCATION, SERIES_ID, STUDY_ID, PATIENT_ID, AUTH_TOKEN,
    /// FILE_UPLOAD_ID) and may be overridden as KEY VALUE pairs.
    Run {
        /// Parameter overrides as KEY VALUE pairs
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        pairs: Vec<String>,
    },

    /// Validate the configuration file and print the effective settings
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Run { pairs } => {
            let code = commands::run::run(&cli.config, &pairs)?;
            std::process::exit(code);
        },
        Commands::CheckConfig => commands::check_config::run(&cli.config),
    }
}
