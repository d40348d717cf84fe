//! On-disk checkpoint envelope.
//!
//! A checkpoint file is one JSON document. Tensor payloads are base64 of
//! little-endian element bytes so a restore reproduces every bit of the saved
//! state, and a SHA-256 over the payload catches truncation or tampering.

use crate::checkpoint::CheckpointLabel;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use kiln_abstraction::{ModelState, Tensor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

pub const FORMAT_VERSION: u32 = 1;

/// Element encoding of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDtype {
    F32,
    F16,
}

impl StorageDtype {
    const fn width(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }
}

impl fmt::Display for StorageDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedTensor {
    pub shape: Vec<usize>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub format_version: u32,
    pub label: String,
    pub epoch: u64,
    pub step: u64,
    #[serde(default)]
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub dtype: StorageDtype,
    pub sha256: String,
    pub tensors: BTreeMap<String, EncodedTensor>,
}

impl CheckpointFile {
    #[must_use]
    pub fn encode(
        label: CheckpointLabel,
        seq: u64,
        state: &ModelState,
        dtype: StorageDtype,
        created_at: DateTime<Utc>,
    ) -> Self {
        let tensors: BTreeMap<String, EncodedTensor> = state
            .tensors
            .iter()
            .map(|(name, tensor)| (name.clone(), encode_tensor(tensor, dtype)))
            .collect();

        Self {
            format_version: FORMAT_VERSION,
            label: label.to_string(),
            epoch: label.epoch,
            step: label.step,
            seq,
            created_at,
            dtype,
            sha256: payload_digest(&tensors),
            tensors,
        }
    }

    /// Verifies the envelope and decodes it back into full-precision state.
    pub fn decode(&self) -> Result<ModelState, String> {
        if self.format_version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", self.format_version));
        }
        if payload_digest(&self.tensors) != self.sha256 {
            return Err("payload digest mismatch".to_string());
        }

        let mut state = ModelState::new();
        for (name, encoded) in &self.tensors {
            let tensor =
                decode_tensor(encoded, self.dtype).map_err(|e| format!("tensor {name}: {e}"))?;
            state.insert(name.clone(), tensor);
        }
        Ok(state)
    }
}

fn encode_tensor(tensor: &Tensor, dtype: StorageDtype) -> EncodedTensor {
    let bytes: Vec<u8> = match dtype {
        StorageDtype::F32 => tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect(),
        StorageDtype::F16 => tensor
            .data()
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect(),
    };
    EncodedTensor { shape: tensor.shape().to_vec(), data: STANDARD.encode(bytes) }
}

fn decode_tensor(encoded: &EncodedTensor, dtype: StorageDtype) -> Result<Tensor, String> {
    let bytes = STANDARD.decode(&encoded.data).map_err(|e| e.to_string())?;
    let numel: usize = encoded.shape.iter().product();
    if bytes.len() != numel * dtype.width() {
        return Err(format!(
            "payload has {} bytes, shape {:?} needs {}",
            bytes.len(),
            encoded.shape,
            numel * dtype.width()
        ));
    }

    let data: Vec<f32> = match dtype {
        StorageDtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        StorageDtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
    };
    Tensor::new(encoded.shape.clone(), data).map_err(|e| e.to_string())
}

fn payload_digest(tensors: &BTreeMap<String, EncodedTensor>) -> String {
    let mut hasher = Sha256::new();
    for (name, tensor) in tensors {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        for dim in &tensor.shape {
            hasher.update((*dim as u64).to_le_bytes());
        }
        hasher.update(tensor.data.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ModelState {
        let mut state = ModelState::new();
        let w = Tensor::new(vec![2, 2], vec![0.1, -2.5, f32::MIN_POSITIVE, 3.0e7]).unwrap();
        state.insert("w", w);
        state.insert("b", Tensor::vector(vec![1.0 / 3.0]));
        state
    }

    fn encode(dtype: StorageDtype) -> CheckpointFile {
        CheckpointFile::encode(CheckpointLabel::new(0, 1), 4, &state(), dtype, Utc::now())
    }

    #[test]
    fn test_f32_payload_is_bit_exact() {
        let file = encode(StorageDtype::F32);
        assert_eq!((file.label.as_str(), file.seq), ("epoch00000_step00000001", 4));
        let decoded = file.decode().unwrap();
        for (name, tensor) in &state().tensors {
            let bits: Vec<u32> = tensor.data().iter().map(|v| v.to_bits()).collect();
            let got: Vec<u32> =
                decoded.get(name).unwrap().data().iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits, got);
        }
    }

    #[test]
    fn test_f16_payload_is_half_sized_and_rounded() {
        let full = encode(StorageDtype::F32);
        let reduced = encode(StorageDtype::F16);
        let full_len = STANDARD.decode(&full.tensors["w"].data).unwrap().len();
        let half_len = STANDARD.decode(&reduced.tensors["w"].data).unwrap().len();
        assert_eq!(full_len, 2 * half_len);

        let decoded = reduced.decode().unwrap();
        let w = decoded.get("w").unwrap().data();
        assert!((w[0] - 0.1).abs() < 1e-3);
        assert_eq!(w[3], f32::INFINITY);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let mut file = encode(StorageDtype::F32);
        file.tensors.get_mut("b").unwrap().data = STANDARD.encode(2.0_f32.to_le_bytes());
        assert!(file.decode().unwrap_err().contains("digest"));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let mut file = encode(StorageDtype::F32);
        file.tensors.get_mut("w").unwrap().data = STANDARD.encode([0u8; 3]);
        file.sha256 = payload_digest(&file.tensors);
        assert!(file.decode().unwrap_err().contains("bytes"));
    }
}
