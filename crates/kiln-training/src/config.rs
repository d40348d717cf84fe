//! Run configuration.
//!
//! Loaded once when a driver is built and treated as read-only afterwards.
//! Precedence: `KILN_*` environment variables, then the TOML file, then the
//! defaults for the optional keys.

use crate::error::{TrainingError, TrainingResult};
use kiln_abstraction::{Device, Precision};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Checkpoints kept by rotation unless configured otherwise.
pub const DEFAULT_RETENTION: usize = 3;
/// Steps between checkpoints unless configured otherwise.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 100;

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub device: Device,
    pub checkpoint_dir: PathBuf,
    pub log_path: PathBuf,
    pub l2_coef: f32,
    /// Carried for the caller's stopping criterion; the engine never reads it.
    pub target_fid: f64,
    #[serde(default = "default_retention")]
    pub retention: usize,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub precision: PrecisionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f32,
    pub momentum: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { learning_rate: 1e-3, momentum: 0.0 }
    }
}

/// Reduced-precision execution and dynamic loss-scale policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    pub mode: Precision,
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Consecutive non-overflowing steps before the scale grows.
    pub growth_interval: u64,
    pub min_scale: f32,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            mode: Precision::Half,
            initial_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
        }
    }
}

impl TrainingConfig {
    /// Builds a config from the required values; everything else defaults.
    #[must_use]
    pub fn new(
        device: Device,
        checkpoint_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        l2_coef: f32,
        target_fid: f64,
    ) -> Self {
        Self {
            device,
            checkpoint_dir: checkpoint_dir.into(),
            log_path: log_path.into(),
            l2_coef,
            target_fid,
            retention: DEFAULT_RETENTION,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            optimizer: OptimizerConfig::default(),
            precision: PrecisionConfig::default(),
        }
    }

    /// Parse a config from TOML text without validating it.
    pub fn from_toml_str(content: &str) -> TrainingResult<Self> {
        toml::from_str(content).map_err(|e| TrainingError::InvalidConfig(e.to_string()))
    }

    /// Load a config from a TOML file without validating it.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TrainingError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| TrainingError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Load from `path`, apply `KILN_*` environment overrides, and validate.
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> TrainingResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> TrainingResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| TrainingError::InvalidConfig(format!("{key}: cannot parse {value:?}")))
        }

        if let Some(v) = lookup("KILN_DEVICE") {
            self.device = v
                .parse()
                .map_err(|e| TrainingError::InvalidConfig(format!("KILN_DEVICE: {e}")))?;
        }
        if let Some(v) = lookup("KILN_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KILN_LOG_PATH") {
            self.log_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("KILN_L2_COEF") {
            self.l2_coef = parse("KILN_L2_COEF", &v)?;
        }
        if let Some(v) = lookup("KILN_TARGET_FID") {
            self.target_fid = parse("KILN_TARGET_FID", &v)?;
        }
        if let Some(v) = lookup("KILN_RETENTION") {
            self.retention = parse("KILN_RETENTION", &v)?;
        }
        if let Some(v) = lookup("KILN_CHECKPOINT_INTERVAL") {
            self.checkpoint_interval = parse("KILN_CHECKPOINT_INTERVAL", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.checkpoint_dir.as_os_str().is_empty() {
            return Err(TrainingError::InvalidConfig("checkpoint_dir is required".to_string()));
        }
        if self.log_path.as_os_str().is_empty() {
            return Err(TrainingError::InvalidConfig("log_path is required".to_string()));
        }
        if !self.l2_coef.is_finite() || self.l2_coef < 0.0 {
            return Err(TrainingError::InvalidConfig("l2_coef must be >= 0".to_string()));
        }
        if !self.target_fid.is_finite() {
            return Err(TrainingError::InvalidConfig("target_fid must be finite".to_string()));
        }
        if self.retention == 0 {
            return Err(TrainingError::InvalidConfig("retention must be >= 1".to_string()));
        }
        if self.checkpoint_interval == 0 {
            return Err(TrainingError::InvalidConfig(
                "checkpoint_interval must be >= 1".to_string(),
            ));
        }
        if !self.optimizer.learning_rate.is_finite() || self.optimizer.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidConfig(
                "optimizer.learning_rate must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            return Err(TrainingError::InvalidConfig(
                "optimizer.momentum must be in [0, 1)".to_string(),
            ));
        }
        self.precision.validate()
    }

    /// Stable digest of the effective config, recorded in run manifests.
    pub fn digest(&self) -> TrainingResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

impl PrecisionConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if !self.min_scale.is_finite() || self.min_scale <= 0.0 {
            return Err(TrainingError::InvalidConfig("precision.min_scale must be > 0".to_string()));
        }
        if !self.initial_scale.is_finite() || self.initial_scale < self.min_scale {
            return Err(TrainingError::InvalidConfig(
                "precision.initial_scale must be >= precision.min_scale".to_string(),
            ));
        }
        if self.growth_factor.is_nan() || self.growth_factor <= 1.0 {
            return Err(TrainingError::InvalidConfig(
                "precision.growth_factor must be > 1".to_string(),
            ));
        }
        if self.backoff_factor.is_nan()
            || self.backoff_factor <= 0.0
            || self.backoff_factor >= 1.0
        {
            return Err(TrainingError::InvalidConfig(
                "precision.backoff_factor must be in (0, 1)".to_string(),
            ));
        }
        if self.growth_interval == 0 {
            return Err(TrainingError::InvalidConfig(
                "precision.growth_interval must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
device = "cpu"
checkpoint_dir = "ckpt"
log_path = "train.csv"
l2_coef = 0.01
target_fid = 12.5
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = TrainingConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.retention, 3);
        assert_eq!(config.checkpoint_interval, 100);
        assert_eq!(config.precision.mode, Precision::Half);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_required_keys_have_no_default() {
        let missing_l2 = MINIMAL.replace("l2_coef = 0.01\n", "");
        assert!(TrainingConfig::from_toml_str(&missing_l2).is_err());

        let missing_fid = MINIMAL.replace("target_fid = 12.5\n", "");
        assert!(TrainingConfig::from_toml_str(&missing_fid).is_err());
    }

    #[test]
    fn test_nested_tables_parse() {
        let text = format!(
            "{MINIMAL}retention = 5\n[optimizer]\nlearning_rate = 0.1\n[precision]\nmode = \"bf16\"\ngrowth_interval = 10\n"
        );
        let config = TrainingConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.retention, 5);
        assert!((config.optimizer.learning_rate - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.precision.mode, Precision::BFloat16);
        assert_eq!(config.precision.growth_interval, 10);
        assert!((config.precision.initial_scale - 65536.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = TrainingConfig::from_toml_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> =
            [("KILN_DEVICE", "cuda:1"), ("KILN_RETENTION", "7"), ("KILN_L2_COEF", "0")].into();
        config.apply_overrides(|k| env.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.device, Device::Cuda(1));
        assert_eq!(config.retention, 7);
        assert!(config.l2_coef.abs() < f32::EPSILON);

        let bad: HashMap<&str, &str> = [("KILN_CHECKPOINT_INTERVAL", "often")].into();
        assert!(config.apply_overrides(|k| bad.get(k).map(|v| (*v).to_string())).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = TrainingConfig::new(Device::Cpu, "ckpt", "log.csv", 0.0, 10.0);
        assert!(base.validate().is_ok());

        let mut c = base.clone();
        c.l2_coef = -1.0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.retention = 0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.checkpoint_interval = 0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.precision.backoff_factor = 1.5;
        assert!(c.validate().is_err());

        let mut c = base;
        c.target_fid = f64::NAN;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_load_from_file_and_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kiln.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let a = TrainingConfig::load_from_file(&path).unwrap();
        let b = TrainingConfig::load_from_file(&path).unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert!(TrainingConfig::load_from_file(&temp.path().join("missing.toml")).is_err());
    }
}
