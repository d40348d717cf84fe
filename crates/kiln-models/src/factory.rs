//! Model factory for creating model instances from configuration.

use crate::LinearModel;
use kiln_abstraction::{ModelError, TrainableModel};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

/// Model type enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Dense linear model (`LinearModel`).
    #[default]
    Linear,
}

impl FromStr for ModelKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" | "dense" => Ok(Self::Linear),
            other => Err(ModelError::InvalidInput(format!("unknown model kind: {other}"))),
        }
    }
}

fn default_seed() -> u64 {
    42
}

/// Model configuration, usually read from the `[model]` table of a run config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub kind: ModelKind,
    pub in_features: usize,
    pub out_features: usize,
    /// Shape generated outputs are arranged in (defaults to `[out_features]`).
    #[serde(default)]
    pub output_shape: Option<Vec<usize>>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl ModelSpec {
    #[must_use]
    pub fn linear(in_features: usize, out_features: usize) -> Self {
        Self {
            kind: ModelKind::Linear,
            in_features,
            out_features,
            output_shape: None,
            seed: default_seed(),
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.in_features == 0 || self.out_features == 0 {
            return Err(ModelError::InvalidInput("model features must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Builds a boxed model for `spec`.
pub fn build_model(spec: &ModelSpec) -> Result<Box<dyn TrainableModel>, ModelError> {
    spec.validate()?;
    debug!(
        kind = ?spec.kind,
        in_features = spec.in_features,
        out_features = spec.out_features,
        "Building model"
    );

    match spec.kind {
        ModelKind::Linear => {
            let mut model = LinearModel::new(spec.in_features, spec.out_features, spec.seed);
            if let Some(shape) = &spec.output_shape {
                model = model.with_output_shape(shape.clone())?;
            }
            Ok(Box::new(model))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_from_str() {
        assert_eq!(ModelKind::from_str("Linear").unwrap(), ModelKind::Linear);
        assert!(ModelKind::from_str("transformer").is_err());
    }

    #[test]
    fn test_spec_from_toml_uses_defaults() {
        let spec: ModelSpec = toml::from_str("in_features = 4\nout_features = 4\n").unwrap();
        assert_eq!(spec.kind, ModelKind::Linear);
        assert_eq!(spec.seed, 42);
        assert!(spec.output_shape.is_none());
    }

    #[test]
    fn test_build_model() {
        let mut spec = ModelSpec::linear(3, 4);
        spec.output_shape = Some(vec![2, 2]);
        let model = build_model(&spec).unwrap();
        assert_eq!(model.parameter_count(), 3 * 4 + 4);

        spec.output_shape = Some(vec![5]);
        assert!(build_model(&spec).is_err());
        assert!(build_model(&ModelSpec::linear(0, 1)).is_err());
    }
}
