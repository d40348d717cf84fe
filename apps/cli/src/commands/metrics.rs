//! Metrics log command.

use crate::config::RunConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_training::read_records;
use std::path::Path;

pub fn execute(config_path: &Path, tail: Option<usize>, json_output: bool) -> Result<()> {
    let run = RunConfig::load(config_path)?;
    let log_path = &run.training.log_path;
    let mut records = read_records(log_path)
        .with_context(|| format!("Failed to read metrics log {}", log_path.display()))?;
    if let Some(n) = tail {
        let skip = records.len().saturating_sub(n);
        records.drain(..skip);
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Metrics ({} records)", records.len()).bold().cyan());
    println!();
    println!("{:<26} {:>6} {:>8} {:>12}  {}", "Timestamp", "Epoch", "Step", "Loss", "Metrics");
    println!("{}", "─".repeat(90));
    for r in &records {
        let metrics = r
            .metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<26} {:>6} {:>8} {:>12.6}  {}",
            r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            r.epoch,
            r.step,
            r.loss,
            metrics.dimmed()
        );
    }
    println!();
    Ok(())
}
