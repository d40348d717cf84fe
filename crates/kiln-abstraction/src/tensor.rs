//! Dense host tensors, batches and execution targets.

use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A dense, row-major `f32` tensor.
///
/// The element count always equals the product of the shape; deserialization
/// rejects payloads that violate this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = ModelError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        Tensor::new(raw.shape, raw.data)
    }
}

impl Tensor {
    /// Creates a tensor, checking that `data` fills `shape` exactly.
    ///
    /// # Errors
    /// Returns `ModelError::InvalidInput` if the element count does not match.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ModelError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ModelError::InvalidInput(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A zero-filled tensor of the given shape.
    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![0.0; len] }
    }

    /// A one-dimensional tensor wrapping `data`.
    #[must_use]
    pub fn vector(data: Vec<f32>) -> Self {
        Self { shape: vec![data.len()], data }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sum of squared elements, accumulated in `f64`.
    #[must_use]
    pub fn sum_of_squares(&self) -> f64 {
        self.data.iter().map(|v| f64::from(*v) * f64::from(*v)).sum()
    }
}

/// Execution target a batch is placed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal => write!(f, "metal"),
        }
    }
}

impl FromStr for Device {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            "metal" | "mps" => Ok(Self::Metal),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| ModelError::InvalidInput(format!("unknown device: {other}"))),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// A named set of tensors consumed by one forward pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    tensors: BTreeMap<String, Tensor>,
    device: Device,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a named tensor.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.tensors.insert(name.into(), tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Like [`Batch::get`], but a missing entry is an error.
    pub fn require(&self, name: &str) -> Result<&Tensor, ModelError> {
        self.tensors.get(name).ok_or_else(|| ModelError::MissingTensor(name.to_string()))
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Places the batch on `device`.
    ///
    /// Host tensors are shared by every target, so this only retags the batch;
    /// models that keep device-resident buffers read the tag in `forward`.
    #[must_use]
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }
}

impl From<BTreeMap<String, Tensor>> for Batch {
    fn from(tensors: BTreeMap<String, Tensor>) -> Self {
        Self { tensors, device: Device::Cpu }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_rejects_mismatched_shape() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn test_tensor_deserialize_validates_shape() {
        let bad = serde_json::from_str::<Tensor>(r#"{"shape":[2,2],"data":[1.0,2.0]}"#);
        assert!(bad.is_err());

        let good: Tensor = serde_json::from_str(r#"{"shape":[1,2],"data":[1.0,2.0]}"#).unwrap();
        assert_eq!(good.shape(), &[1, 2]);
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("mps".parse::<Device>().unwrap(), Device::Metal);
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_batch_to_device_keeps_tensors() {
        let batch = Batch::new().with("x", Tensor::vector(vec![1.0, 2.0]));
        let moved = batch.clone().to_device(Device::Metal);
        assert_eq!(moved.device(), Device::Metal);
        assert_eq!(moved.get("x"), batch.get("x"));
        assert!(moved.require("y").is_err());
    }
}
