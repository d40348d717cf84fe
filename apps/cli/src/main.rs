//! Kiln CLI - Command-line interface for the Kiln fine-tuning engine
//!
//! This CLI provides a `kiln` command for running training epochs with
//! checkpoint rollback, inspecting and exporting checkpoints, rendering
//! comparison grids, and reading the metrics log.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{checkpoints, compare, metrics, train};
use commands::checkpoints::CheckpointsCommand;

/// Kiln CLI - Fine-tuning with checkpoint rollback
#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    author,
    version,
    about = "Kiln - Fine-tuning with durable checkpoints and rollback",
    long_about = "Kiln drives a trainable model epoch by epoch under dynamic loss scaling,\n\
                  keeps a bounded set of checkpoints, and rolls back to the latest one \
                  when a step fails."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train for one or more epochs
    ///
    /// Reads batches from a JSON Lines file, one batch per line. A failed epoch
    /// is rolled back to the latest checkpoint and retried up to --retries times.
    Train {
        /// Path to the run config (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the training data (JSONL)
        #[arg(short, long)]
        data: PathBuf,

        /// Number of epochs to run
        #[arg(long, default_value = "1")]
        epochs: u64,

        /// Times a rolled-back epoch is retried before giving up
        #[arg(long, default_value = "0")]
        retries: u32,

        /// Start from the latest checkpoint instead of fresh weights
        #[arg(long)]
        resume: bool,

        /// Output the run manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect and export checkpoints
    #[command(subcommand)]
    Checkpoints(CheckpointsCommand),

    /// Render a 2x2 comparison grid from up to four conditioning samples
    Compare {
        /// Path to the run config (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Conditioning samples (JSONL, one tensor per line)
        #[arg(short, long)]
        samples: PathBuf,

        /// Checkpoint label to load (defaults to the latest)
        #[arg(long)]
        checkpoint: Option<String>,
    },

    /// Show the metrics log
    Metrics {
        /// Path to the run config (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Only show the last N records
        #[arg(long)]
        tail: Option<usize>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --json output stays machine-readable.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Train { config, data, epochs, retries, resume, json } => {
            train::execute(&config, &data, epochs, retries, resume, json)?;
        }
        Command::Checkpoints(command) => {
            checkpoints::execute(command)?;
        }
        Command::Compare { config, samples, checkpoint } => {
            compare::execute(&config, &samples, checkpoint.as_deref())?;
        }
        Command::Metrics { config, tail, json } => {
            metrics::execute(&config, tail, json)?;
        }
    }

    Ok(())
}
