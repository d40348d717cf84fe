//! Model abstraction layer for Kiln.
//!
//! This module defines the contract the training engine uses to drive a
//! trainable model. The engine never looks inside a model: it runs forward and
//! backward passes, reads and updates named parameters, snapshots and restores
//! state, and toggles between training and inference mode.

mod tensor;

pub use tensor::{Batch, Device, Tensor};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Represents an error raised by a model collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// The input did not have the layout the model expects.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A batch was missing a tensor the model reads.
    #[error("Missing tensor in batch: {0}")]
    MissingTensor(String),

    /// A state snapshot does not fit this model.
    #[error("State mismatch: {0}")]
    StateMismatch(String),

    /// `backward` was called without a preceding `forward`.
    #[error("Backward called before forward")]
    NoForwardPass,

    /// Generation failed.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Other unexpected errors.
    #[error("Other Model Error: {0}")]
    Other(String),
}

/// Numeric precision the forward pass runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    /// IEEE single precision.
    #[serde(rename = "fp32")]
    Full,
    /// IEEE half precision.
    #[default]
    #[serde(rename = "fp16")]
    Half,
    /// Brain floating point: f32 exponent range, 7 mantissa bits.
    #[serde(rename = "bf16")]
    BFloat16,
}

impl Precision {
    /// Rounds `value` to the nearest value representable in this precision.
    #[must_use]
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::Full => value,
            Self::Half => half::f16::from_f32(value).to_f32(),
            Self::BFloat16 => half::bf16::from_f32(value).to_f32(),
        }
    }

    #[must_use]
    pub fn is_reduced(self) -> bool {
        !matches!(self, Self::Full)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "fp32"),
            Self::Half => write!(f, "fp16"),
            Self::BFloat16 => write!(f, "bf16"),
        }
    }
}

impl FromStr for Precision {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fp32" | "f32" | "full" => Ok(Self::Full),
            "fp16" | "f16" | "half" => Ok(Self::Half),
            "bf16" | "bfloat16" => Ok(Self::BFloat16),
            other => Err(ModelError::InvalidInput(format!("unknown precision: {other}"))),
        }
    }
}

/// A named, trainable parameter together with its gradient buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    /// Gradient accumulator, same length as `value`. Additive across backward
    /// passes until cleared with [`Parameter::zero_grad`].
    pub grad: Vec<f32>,
}

impl Parameter {
    #[must_use]
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        let grad = vec![0.0; value.len()];
        Self { name: name.into(), value, grad }
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// A serializable snapshot of a model's mutable state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub tensors: BTreeMap<String, Tensor>,
}

impl ModelState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots the values of `params` (gradients are not part of state).
    pub fn from_parameters<'a>(params: impl IntoIterator<Item = &'a Parameter>) -> Self {
        Self {
            tensors: params.into_iter().map(|p| (p.name.clone(), p.value.clone())).collect(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// The result of one forward pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardOutput {
    /// Scalar task loss, before any regularization.
    pub loss: f32,
    /// Additional flat metrics reported by the model.
    pub metrics: BTreeMap<String, f64>,
}

impl ForwardOutput {
    #[must_use]
    pub fn new(loss: f32) -> Self {
        Self { loss, metrics: BTreeMap::new() }
    }

    /// Builder: attach a metric.
    #[must_use]
    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// A trait for models the training engine can fine-tune.
///
/// All calls are synchronous. A model instance is driven by exactly one
/// training run at a time, so implementations need `Send` but not `Sync`.
pub trait TrainableModel: Send {
    /// Runs a forward pass over `batch` and returns the task loss.
    ///
    /// The pass is executed in `precision`; the model retains whatever it
    /// needs for the following [`TrainableModel::backward`] call.
    ///
    /// # Errors
    /// Returns a `ModelError` if the batch does not fit the model.
    fn forward(&mut self, batch: &Batch, precision: Precision) -> Result<ForwardOutput, ModelError>;

    /// Accumulates `loss_scale * d(task_loss)/d(param)` into each parameter's
    /// gradient buffer for the most recent forward pass.
    ///
    /// # Errors
    /// Returns `ModelError::NoForwardPass` if no forward pass is pending.
    fn backward(&mut self, loss_scale: f32) -> Result<(), ModelError>;

    /// Named parameters, in a stable order.
    fn parameters(&self) -> Vec<&Parameter>;

    /// Mutable access to the named parameters, in the same order.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Produces an output tensor for a conditioning input.
    ///
    /// # Errors
    /// Returns a `ModelError` if the input does not fit the model.
    fn generate(&mut self, input: &Tensor) -> Result<Tensor, ModelError>;

    /// Snapshot of the model's mutable state.
    fn state(&self) -> ModelState {
        ModelState::from_parameters(self.parameters())
    }

    /// Replaces the model's state with `state`.
    ///
    /// # Errors
    /// Returns `ModelError::StateMismatch` if a tensor is missing, unexpected,
    /// or shaped differently from the model's parameter.
    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        let mut params = self.parameters_mut();
        if params.len() != state.len() {
            return Err(ModelError::StateMismatch(format!(
                "expected {} tensors, snapshot has {}",
                params.len(),
                state.len()
            )));
        }
        for param in &params {
            let tensor = state.get(&param.name).ok_or_else(|| {
                ModelError::StateMismatch(format!("missing tensor: {}", param.name))
            })?;
            if tensor.shape() != param.value.shape() {
                return Err(ModelError::StateMismatch(format!(
                    "tensor {} has shape {:?}, expected {:?}",
                    param.name,
                    tensor.shape(),
                    param.value.shape()
                )));
            }
        }
        for param in &mut params {
            if let Some(tensor) = state.get(&param.name) {
                param.value = tensor.clone();
            }
        }
        Ok(())
    }

    fn set_train_mode(&mut self);

    fn set_eval_mode(&mut self);

    fn is_training(&self) -> bool;

    /// Total number of scalar parameters.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.value.len()).sum()
    }
}

impl<T: TrainableModel + ?Sized> TrainableModel for Box<T> {
    fn forward(
        &mut self,
        batch: &Batch,
        precision: Precision,
    ) -> Result<ForwardOutput, ModelError> {
        (**self).forward(batch, precision)
    }

    fn backward(&mut self, loss_scale: f32) -> Result<(), ModelError> {
        (**self).backward(loss_scale)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        (**self).parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        (**self).parameters_mut()
    }

    fn generate(&mut self, input: &Tensor) -> Result<Tensor, ModelError> {
        (**self).generate(input)
    }

    fn state(&self) -> ModelState {
        (**self).state()
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        (**self).load_state(state)
    }

    fn set_train_mode(&mut self) {
        (**self).set_train_mode();
    }

    fn set_eval_mode(&mut self) {
        (**self).set_eval_mode();
    }

    fn is_training(&self) -> bool {
        (**self).is_training()
    }
}
