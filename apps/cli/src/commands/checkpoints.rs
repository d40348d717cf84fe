//! Checkpoint inspection and export commands.

use crate::config::RunConfig;
use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use kiln_training::{export_reduced_precision, CheckpointRef, CheckpointStore, StorageDtype};
use serde_json::json;
use std::path::PathBuf;

/// Checkpoint subcommands
#[derive(Subcommand, Debug)]
pub enum CheckpointsCommand {
    /// List checkpoints and reduced-precision exports, oldest first
    List {
        /// Path to the run config (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write an fp16 copy of a checkpoint next to it
    Export {
        /// Checkpoint label (e.g. epoch1_step200); the newest save of that label
        /// is used unless a sequence prefix is given (e.g. 00000004_epoch1_step200)
        label: String,

        /// Path to the run config (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn execute(command: CheckpointsCommand) -> Result<()> {
    match command {
        CheckpointsCommand::List { config, json } => list(&config, json),
        CheckpointsCommand::Export { label, config } => export(&config, &label),
    }
}

fn open_store(config_path: &std::path::Path) -> Result<CheckpointStore> {
    let run = RunConfig::load(config_path)?;
    CheckpointStore::open(&run.training.checkpoint_dir, run.training.retention)
        .context("Failed to open checkpoint store")
}

fn list(config_path: &std::path::Path, json_output: bool) -> Result<()> {
    let store = open_store(config_path)?;
    let mut checkpoints = store.list()?;
    checkpoints.extend(store.list_exports()?);
    checkpoints.sort_by_key(|c| (c.recency(), c.dtype == StorageDtype::F16));

    if json_output {
        let out: Vec<_> = checkpoints.iter().map(checkpoint_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Checkpoints ({})", checkpoints.len()).bold().cyan());
    println!();

    if checkpoints.is_empty() {
        println!("  {}", "No checkpoints found.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:>8} {:<28} {:<6} {}", "Seq", "Label", "Dtype", "Path");
    println!("{}", "─".repeat(90));
    for ckpt in &checkpoints {
        println!(
            "{:>8} {:<28} {:<6} {}",
            ckpt.seq,
            ckpt.label.to_string().cyan(),
            ckpt.dtype.to_string().dimmed(),
            ckpt.path.display().to_string().dimmed()
        );
    }
    println!();
    Ok(())
}

fn checkpoint_json(ckpt: &CheckpointRef) -> serde_json::Value {
    json!({
        "seq": ckpt.seq,
        "label": ckpt.label.to_string(),
        "epoch": ckpt.label.epoch,
        "step": ckpt.label.step,
        "dtype": ckpt.dtype,
        "path": ckpt.path,
    })
}

fn export(config_path: &std::path::Path, label: &str) -> Result<()> {
    let store = open_store(config_path)?;
    let source = store.resolve(label)?;
    let exported = export_reduced_precision(&store, &source)
        .with_context(|| format!("Failed to export checkpoint {}", source.label))?;

    println!("{} {}", "Exported".green(), exported.path.display());
    Ok(())
}
