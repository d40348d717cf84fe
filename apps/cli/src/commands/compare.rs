//! Comparison grid command.

use crate::config::RunConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_models::build_model;
use kiln_training::{compare, read_jsonl_tensors, CheckpointStore};
use std::path::Path;

pub fn execute(config_path: &Path, samples_path: &Path, checkpoint: Option<&str>) -> Result<()> {
    let run = RunConfig::load(config_path)?;
    let store = CheckpointStore::open(&run.training.checkpoint_dir, run.training.retention)
        .context("Failed to open checkpoint store")?;
    let mut model = build_model(&run.model).context("Failed to build model")?;

    let ckpt = match checkpoint {
        Some(label) => Some(store.resolve(label)?),
        None => store.latest()?,
    };
    match &ckpt {
        Some(ckpt) => store
            .restore(&mut model, ckpt)
            .with_context(|| format!("Failed to load checkpoint {}", ckpt.label))?,
        None => tracing::warn!("No checkpoint found, rendering from freshly initialised weights"),
    }

    let samples = read_jsonl_tensors(samples_path)?;
    if samples.len() > 4 {
        tracing::info!(provided = samples.len(), "Only the first four samples are rendered");
    }
    let path = compare(&mut model, &samples, store.layout())?;

    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}
