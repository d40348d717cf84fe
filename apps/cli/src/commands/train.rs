//! Training command implementation.

use crate::config::RunConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_abstraction::TrainableModel;
use kiln_models::build_model;
use kiln_training::{
    compute_dataset_id, ArtifactKind, CheckpointStore, EpochSummary, JsonlBatches, Rollback,
    TrainingDriver, TrainingManifest, TracingProgressSink,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn execute(
    config_path: &Path,
    data: &Path,
    epochs: u64,
    retries: u32,
    resume: bool,
    json_output: bool,
) -> Result<()> {
    let run = RunConfig::load(config_path)?;
    let model = build_model(&run.model).context("Failed to build model")?;

    let mut manifest = TrainingManifest::new(run.training.digest()?);
    manifest.dataset_id = Some(compute_dataset_id(data)?);

    let mut driver = TrainingDriver::new(run.training.clone(), model)
        .context("Failed to start training run")?
        .with_progress(Arc::new(TracingProgressSink));

    if resume {
        resume_from_latest(&mut driver)?;
    }

    let result = run_epochs(&mut driver, data, epochs, retries, &mut manifest, json_output);

    let store = driver.store().clone();
    let recorded = driver
        .finish()
        .context("Failed to close metrics log")
        .and_then(|_| record_run(&mut manifest, &store, &run.training.log_path, data));

    // A failed epoch outranks any bookkeeping failure after it.
    if let Err(err) = &recorded
        && result.is_err()
    {
        tracing::warn!(error = %format!("{err:#}"), "Failed to record training manifest");
    }
    result?;
    let manifest_path = recorded?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Epochs:      {}", manifest.epochs.len().to_string().cyan());
    if let Some(last) = manifest.epochs.last() {
        println!("  Final loss:  {}", format!("{:.6}", last.mean_loss).cyan());
    }
    if manifest.interruptions > 0 {
        println!("  Rollbacks:   {}", manifest.interruptions.to_string().yellow());
    }
    println!("  Checkpoints: {}", store.dir().display().to_string().dimmed());
    println!("  Manifest:    {}", manifest_path.display().to_string().dimmed());
    println!();
    Ok(())
}

/// Adds the run's artifacts to `manifest` and writes it next to the checkpoints.
fn record_run(
    manifest: &mut TrainingManifest,
    store: &CheckpointStore,
    log_path: &Path,
    data: &Path,
) -> Result<PathBuf> {
    for ckpt in store.list()? {
        manifest.add_artifact(ArtifactKind::FullCheckpoint, ckpt.path)?;
    }
    for export in store.list_exports()? {
        manifest.add_artifact(ArtifactKind::ReducedCheckpoint, export.path)?;
    }
    let comparison = store.layout().comparison_path();
    if comparison.exists() {
        manifest.add_artifact(ArtifactKind::Comparison, comparison)?;
    }
    if log_path.exists() {
        manifest.add_artifact(ArtifactKind::Metrics, log_path.to_path_buf())?;
    }
    manifest.add_artifact(ArtifactKind::DatasetJsonl, data.to_path_buf())?;
    let path = manifest.write(store.layout()).context("Failed to write training manifest")?;
    Ok(path)
}

fn resume_from_latest<M: TrainableModel>(driver: &mut TrainingDriver<M>) -> Result<()> {
    let Some(latest) = driver.store().latest()? else {
        tracing::warn!("No checkpoint to resume from, starting fresh");
        return Ok(());
    };
    let store = driver.store().clone();
    store
        .restore(driver.model_mut(), &latest)
        .with_context(|| format!("Failed to resume from checkpoint {}", latest.label))?;
    tracing::info!(label = %latest.label, "Resumed from checkpoint");
    Ok(())
}

fn run_epochs<M: TrainableModel>(
    driver: &mut TrainingDriver<M>,
    data: &Path,
    epochs: u64,
    retries: u32,
    manifest: &mut TrainingManifest,
    json_output: bool,
) -> Result<()> {
    for epoch in 0..epochs {
        let mut attempts = 0;
        loop {
            let source = JsonlBatches::open(data)?;
            match driver.run_epoch(source, epoch).into_result() {
                Ok(summary) => {
                    if !json_output {
                        print_epoch(&summary);
                    }
                    manifest.epochs.push(summary);
                    break;
                }
                Err(err) => {
                    manifest.interruptions += 1;
                    let rolled_back = matches!(err.rollback(), Some(Rollback::Restored(_)));
                    if rolled_back && attempts < retries {
                        attempts += 1;
                        if !json_output {
                            eprintln!(
                                "  {} {} (retry {}/{})",
                                "!".yellow(),
                                err.to_string().yellow(),
                                attempts,
                                retries
                            );
                        }
                        continue;
                    }
                    return Err(err).with_context(|| format!("Epoch {epoch} failed"));
                }
            }
        }
    }
    Ok(())
}

fn print_epoch(summary: &EpochSummary) {
    let overflow = if summary.overflow_steps > 0 {
        format!(" ({} overflowed)", summary.overflow_steps).yellow().to_string()
    } else {
        String::new()
    };
    println!(
        "  {} epoch {:>3}  loss {}  steps {}{}",
        "✓".green(),
        summary.epoch,
        format!("{:.6}", summary.mean_loss).cyan(),
        summary.steps,
        overflow
    );
}
