//! Capacity-bounded checkpoint store.
//!
//! Every save gets the next number in the store's save sequence, and the
//! sequence is the recency key: a re-run of an epoch orders after the
//! attempt it replaces even though their `(epoch, step)` labels repeat.
//! Checkpoint files are never overwritten. A store assumes it is the only
//! writer of its directory.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::{parse_stem, CheckpointFileKind, CheckpointLayout};
use crate::snapshot::{CheckpointFile, StorageDtype};
use chrono::Utc;
use kiln_abstraction::{ModelState, TrainableModel};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Training position a checkpoint was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointLabel {
    pub epoch: u64,
    pub step: u64,
}

impl CheckpointLabel {
    #[must_use]
    pub const fn new(epoch: u64, step: u64) -> Self {
        Self { epoch, step }
    }

    /// Parses `epoch{E}_step{S}`, padded or not.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("epoch")?;
        let (epoch, step) = rest.split_once("_step")?;
        if epoch.is_empty() || step.is_empty() {
            return None;
        }
        if !epoch.bytes().all(|b| b.is_ascii_digit()) || !step.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some(Self { epoch: epoch.parse().ok()?, step: step.parse().ok()? })
    }
}

impl fmt::Display for CheckpointLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch{:05}_step{:08}", self.epoch, self.step)
    }
}

/// A checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Position in the store's save sequence; exports share their source's.
    pub seq: u64,
    pub label: CheckpointLabel,
    pub path: PathBuf,
    pub dtype: StorageDtype,
}

impl CheckpointRef {
    /// Ordering key: save sequence first, label as tie-break for unsequenced files.
    #[must_use]
    pub fn recency(&self) -> (u64, CheckpointLabel) {
        (self.seq, self.label)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: CheckpointLayout,
    retention: usize,
}

impl CheckpointStore {
    /// Opens (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, retention: usize) -> TrainingResult<Self> {
        if retention == 0 {
            return Err(TrainingError::InvalidConfig("retention must be >= 1".to_string()));
        }
        let layout = CheckpointLayout::new(dir.into());
        layout.ensure_dirs()?;
        Ok(Self { layout, retention })
    }

    #[must_use]
    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.layout.root()
    }

    #[must_use]
    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Persists `state` as a new checkpoint, then rotates down to the
    /// retention limit.
    ///
    /// Saving a label that already exists adds a newer checkpoint with the same
    /// label; the older file is left as written.
    pub fn save(
        &self,
        state: &ModelState,
        label: CheckpointLabel,
    ) -> TrainingResult<CheckpointRef> {
        let seq = self.next_seq()?;
        let path = self.layout.checkpoint_path(seq, &label);
        let file = CheckpointFile::encode(label, seq, state, StorageDtype::F32, Utc::now());
        self.write_file(&path, &file, WriteMode::CreateNew)?;
        info!(label = %label, seq, path = %path.display(), "Saved checkpoint");

        self.rotate(self.retention);
        Ok(CheckpointRef { seq, label, path, dtype: StorageDtype::F32 })
    }

    /// Snapshots `model` and saves it under `label`.
    pub fn save_model<M>(&self, model: &M, label: CheckpointLabel) -> TrainingResult<CheckpointRef>
    where
        M: TrainableModel + ?Sized,
    {
        self.save(&model.state(), label)
    }

    fn next_seq(&self) -> TrainingResult<u64> {
        let newest = self.scan(Some)?.into_iter().map(|c| c.seq).max();
        Ok(newest.map_or(1, |seq| seq + 1))
    }

    /// Deletes all but the `keep` most recent checkpoints.
    ///
    /// Best-effort: listing and deletion failures are logged, never returned.
    /// Returns the checkpoints that were actually removed.
    pub fn rotate(&self, keep: usize) -> Vec<CheckpointRef> {
        let checkpoints = match self.list() {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    dir = %self.dir().display(),
                    error = %e,
                    "Failed to list checkpoints for rotation"
                );
                return Vec::new();
            }
        };

        let excess = checkpoints.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);
        for ckpt in checkpoints.into_iter().take(excess) {
            match std::fs::remove_file(&ckpt.path) {
                Ok(()) => {
                    debug!(label = %ckpt.label, seq = ckpt.seq, "Rotated out checkpoint");
                    removed.push(ckpt);
                }
                Err(e) => {
                    warn!(
                        label = %ckpt.label,
                        path = %ckpt.path.display(),
                        error = %e,
                        "Failed to remove old checkpoint"
                    );
                }
            }
        }
        removed
    }

    /// Full-precision checkpoints, oldest first.
    pub fn list(&self) -> TrainingResult<Vec<CheckpointRef>> {
        self.scan(|kind| match kind {
            CheckpointFileKind::Full { .. } => Some(kind),
            CheckpointFileKind::Reduced { .. } => None,
        })
    }

    /// Reduced-precision exports, oldest first.
    pub fn list_exports(&self) -> TrainingResult<Vec<CheckpointRef>> {
        self.scan(|kind| match kind {
            CheckpointFileKind::Reduced { .. } => Some(kind),
            CheckpointFileKind::Full { .. } => None,
        })
    }

    /// Matching entries, oldest first, one per `(seq, label, dtype)`.
    ///
    /// When several names parse to the same checkpoint (`epoch1_step5.ckpt`
    /// and `epoch00001_step00000005.ckpt`), the canonical name wins, then the
    /// padded one, then the first path in sort order.
    fn scan<F>(&self, select: F) -> TrainingResult<Vec<CheckpointRef>>
    where
        F: Fn(CheckpointFileKind) -> Option<CheckpointFileKind>,
    {
        let dir = self.dir();
        let entries = std::fs::read_dir(dir).map_err(|e| TrainingError::storage(dir, e))?;

        let mut found: BTreeMap<(u64, CheckpointLabel, bool), (CheckpointRef, u8)> =
            BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| TrainingError::storage(dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(kind) = CheckpointLayout::classify(&name).and_then(&select) else {
                continue;
            };
            let (seq, label, dtype) = match kind {
                CheckpointFileKind::Full { seq, label } => (seq, label, StorageDtype::F32),
                CheckpointFileKind::Reduced { seq, label } => (seq, label, StorageDtype::F16),
            };
            let rank = if kind.file_name() == name {
                2
            } else {
                u8::from(name.contains(&label.to_string()))
            };
            let ckpt = CheckpointRef { seq, label, path: entry.path(), dtype };

            let key = (seq, label, dtype == StorageDtype::F16);
            let preferred = found.get(&key).is_none_or(|(kept, kept_rank)| {
                (rank, Reverse(&ckpt.path)) > (*kept_rank, Reverse(&kept.path))
            });
            let ignored = if preferred {
                found.insert(key, (ckpt, rank)).map(|(dropped, _)| dropped)
            } else {
                Some(ckpt)
            };
            if let Some(ignored) = ignored {
                warn!(path = %ignored.path.display(), "Ignoring duplicate checkpoint");
            }
        }
        Ok(found.into_values().map(|(ckpt, _)| ckpt).collect())
    }

    /// The most recently saved full-precision checkpoint, if any.
    pub fn latest(&self) -> TrainingResult<Option<CheckpointRef>> {
        Ok(self.list()?.pop())
    }

    /// Looks up a checkpoint by label text (`epoch3_step200`, padded or not).
    ///
    /// When several checkpoints share the label, the most recently saved one
    /// is returned; a sequence prefix (`00000004_epoch3_step200`) selects one
    /// exactly. A `_fp16` suffix selects the reduced-precision export.
    pub fn resolve(&self, label: &str) -> TrainingResult<CheckpointRef> {
        let (base, dtype) = match label.strip_suffix("_fp16") {
            Some(base) => (base, StorageDtype::F16),
            None => (label, StorageDtype::F32),
        };
        let (seq, parsed) = parse_stem(base).ok_or_else(|| {
            TrainingError::InvalidConfig(format!("invalid checkpoint label: {label}"))
        })?;

        let candidates = match dtype {
            StorageDtype::F32 => self.list()?,
            StorageDtype::F16 => self.list_exports()?,
        };
        candidates
            .into_iter()
            .rev()
            .find(|c| c.label == parsed && seq.is_none_or(|seq| c.seq == seq))
            .ok_or_else(|| {
                TrainingError::storage(
                    &self.layout.checkpoint_path(seq.unwrap_or(0), &parsed),
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("checkpoint {label} not found"),
                    ),
                )
            })
    }

    pub(crate) fn read_file(&self, ckpt: &CheckpointRef) -> TrainingResult<CheckpointFile> {
        let bytes =
            std::fs::read(&ckpt.path).map_err(|e| TrainingError::storage(&ckpt.path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TrainingError::corrupt(&ckpt.label.to_string(), e))
    }

    /// Writes `file` to a staging path, syncs it, and renames it into place.
    ///
    /// With `WriteMode::CreateNew` an existing target is an `AlreadyExists`
    /// storage error and is left untouched.
    pub(crate) fn write_file(
        &self,
        path: &Path,
        file: &CheckpointFile,
        mode: WriteMode,
    ) -> TrainingResult<()> {
        if mode == WriteMode::CreateNew && path.symlink_metadata().is_ok() {
            return Err(TrainingError::storage(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "checkpoint file already exists",
                ),
            ));
        }

        let staging = self.layout.staging_path(path);
        let bytes = serde_json::to_vec(file)?;
        let write = || -> std::io::Result<()> {
            let mut out = std::fs::File::create(&staging)?;
            out.write_all(&bytes)?;
            out.sync_all()?;
            std::fs::rename(&staging, path)
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(&staging);
            TrainingError::storage(path, e)
        })
    }

    /// Reads and verifies a checkpoint, returning its decoded state.
    pub fn load(&self, ckpt: &CheckpointRef) -> TrainingResult<ModelState> {
        let file = self.read_file(ckpt)?;
        file.decode().map_err(|reason| TrainingError::corrupt(&ckpt.label.to_string(), reason))
    }

    /// Loads `ckpt` into `model` in place.
    ///
    /// The model is left untouched if the snapshot does not fit it.
    pub fn restore<M>(&self, model: &mut M, ckpt: &CheckpointRef) -> TrainingResult<()>
    where
        M: TrainableModel + ?Sized,
    {
        let state = self.load(ckpt)?;
        model
            .load_state(&state)
            .map_err(|e| TrainingError::corrupt(&ckpt.label.to_string(), e))?;
        info!(label = %ckpt.label, seq = ckpt.seq, "Restored checkpoint");
        Ok(())
    }
}

/// Whether a write may replace an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    CreateNew,
    /// Derived files whose content is a pure function of their source.
    Replace,
}
