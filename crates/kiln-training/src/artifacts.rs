use crate::driver::EpochSummary;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::CheckpointLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    FullCheckpoint,
    ReducedCheckpoint,
    Comparison,
    Metrics,
    DatasetJsonl,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

/// Summary of one CLI training run, written next to its checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub created_at: DateTime<Utc>,
    pub config_digest: String,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub epochs: Vec<EpochSummary>,
    #[serde(default)]
    pub interruptions: u32,
    pub artifacts: Vec<TrainingArtifact>,
}

impl TrainingManifest {
    #[must_use]
    pub fn new(config_digest: String) -> Self {
        Self {
            created_at: Utc::now(),
            config_digest,
            dataset_id: None,
            epochs: Vec::new(),
            interruptions: 0,
            artifacts: Vec::new(),
        }
    }

    pub fn add_artifact(&mut self, kind: ArtifactKind, path: PathBuf) -> TrainingResult<()> {
        self.artifacts.push(make_artifact(kind, path)?);
        Ok(())
    }

    /// Writes the manifest to `training_manifest.json` under `layout`.
    pub fn write(&self, layout: &CheckpointLayout) -> TrainingResult<PathBuf> {
        let path = layout.manifest_path();
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| TrainingError::storage(&path, e))?;
        Ok(path)
    }

    pub fn read(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| TrainingError::storage(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path).map_err(|e| TrainingError::storage(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> TrainingResult<TrainingArtifact> {
    let hash = sha256_file(&path)?;
    Ok(TrainingArtifact { kind, path, sha256: hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_roundtrips_through_layout() {
        let temp = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(temp.path().to_path_buf());
        let data = temp.path().join("data.jsonl");
        std::fs::write(&data, "{}\n").unwrap();

        let mut manifest = TrainingManifest::new("abc".to_string());
        manifest.add_artifact(ArtifactKind::DatasetJsonl, data.clone()).unwrap();
        let path = manifest.write(&layout).unwrap();

        let read = TrainingManifest::read(&path).unwrap();
        assert_eq!(read.config_digest, "abc");
        assert_eq!(read.artifacts[0].sha256, sha256_file(&data).unwrap());
    }

    #[test]
    fn test_missing_artifact_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let err = make_artifact(ArtifactKind::Other, temp.path().join("gone")).unwrap_err();
        assert!(matches!(err, TrainingError::Storage { .. }));
    }
}
