//! Run configuration loading.

use anyhow::{Context, Result};
use kiln_models::ModelSpec;
use kiln_training::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A run config: the training keys at the top level plus a `[model]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub training: TrainingConfig,
    pub model: ModelSpec,
}

impl RunConfig {
    /// Load a run config.
    ///
    /// Precedence:
    /// 1. Environment variables (`KILN_*`)
    /// 2. The TOML file at `path`
    /// 3. Defaults for the optional keys
    ///
    /// Relative `checkpoint_dir` and `log_path` resolve against the config
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        config.training.apply_overrides(|key| std::env::var(key).ok())?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if config.training.checkpoint_dir.is_relative() {
            config.training.checkpoint_dir = base.join(&config.training.checkpoint_dir);
        }
        if config.training.log_path.is_relative() {
            config.training.log_path = base.join(&config.training.log_path);
        }

        config.training.validate()?;
        config.model.validate()?;
        Ok(config)
    }
}
