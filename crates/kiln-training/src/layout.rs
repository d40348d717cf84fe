use crate::checkpoint::CheckpointLabel;
use crate::error::{TrainingError, TrainingResult};
use std::path::{Path, PathBuf};

const CHECKPOINT_EXT: &str = ".ckpt";
const REDUCED_SUFFIX: &str = "_fp16";
const STAGING_EXT: &str = ".tmp";

/// Filesystem layout of a checkpoint directory.
///
/// ```text
/// <root>/00000007_epoch00000_step00000100.ckpt        full-precision checkpoint
/// <root>/00000007_epoch00000_step00000100_fp16.ckpt   reduced-precision export
/// <root>/comparison.ppm                               qualitative comparison grid
/// <root>/training_manifest.json                       run manifest
/// ```
///
/// The leading number is the store's save sequence. Names without it are
/// read as sequence 0.
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    root: PathBuf,
}

/// What a file inside the checkpoint directory is, judged by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFileKind {
    Full { seq: u64, label: CheckpointLabel },
    Reduced { seq: u64, label: CheckpointLabel },
}

impl CheckpointFileKind {
    /// The name this checkpoint is written under.
    #[must_use]
    pub fn file_name(&self) -> String {
        match self {
            Self::Full { seq, label } => format!("{}{CHECKPOINT_EXT}", stem(*seq, label)),
            Self::Reduced { seq, label } => {
                format!("{}{REDUCED_SUFFIX}{CHECKPOINT_EXT}", stem(*seq, label))
            }
        }
    }
}

fn stem(seq: u64, label: &CheckpointLabel) -> String {
    format!("{seq:08}_{label}")
}

/// Splits `00000007_epoch0_step5` into its sequence and label; the sequence
/// prefix is optional.
#[must_use]
pub fn parse_stem(stem: &str) -> Option<(Option<u64>, CheckpointLabel)> {
    match stem.split_once('_') {
        Some((seq, rest)) if !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit()) => {
            Some((Some(seq.parse().ok()?), CheckpointLabel::parse(rest)?))
        }
        _ => CheckpointLabel::parse(stem).map(|label| (None, label)),
    }
}

impl CheckpointLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn checkpoint_path(&self, seq: u64, label: &CheckpointLabel) -> PathBuf {
        self.root.join(CheckpointFileKind::Full { seq, label: *label }.file_name())
    }

    #[must_use]
    pub fn reduced_path(&self, seq: u64, label: &CheckpointLabel) -> PathBuf {
        self.root.join(CheckpointFileKind::Reduced { seq, label: *label }.file_name())
    }

    /// Hidden sibling a file is written to before being renamed into place.
    #[must_use]
    pub fn staging_path(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.join(format!(".{name}{STAGING_EXT}"))
    }

    #[must_use]
    pub fn comparison_path(&self) -> PathBuf {
        self.root.join("comparison.ppm")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("training_manifest.json")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| TrainingError::storage(&self.root, e))
    }

    /// Classify a directory entry; anything that is not a checkpoint is `None`.
    #[must_use]
    pub fn classify(file_name: &str) -> Option<CheckpointFileKind> {
        let stem = file_name.strip_suffix(CHECKPOINT_EXT)?;
        match stem.strip_suffix(REDUCED_SUFFIX) {
            Some(base) => parse_stem(base)
                .map(|(seq, label)| CheckpointFileKind::Reduced { seq: seq.unwrap_or(0), label }),
            None => parse_stem(stem)
                .map(|(seq, label)| CheckpointFileKind::Full { seq: seq.unwrap_or(0), label }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(temp.path().join("ckpt"));
        let label = CheckpointLabel::new(2, 100);

        assert!(layout
            .checkpoint_path(7, &label)
            .ends_with("00000007_epoch00002_step00000100.ckpt"));
        assert!(layout
            .reduced_path(7, &label)
            .ends_with("00000007_epoch00002_step00000100_fp16.ckpt"));
        assert!(layout
            .staging_path(&layout.checkpoint_path(7, &label))
            .ends_with(".00000007_epoch00002_step00000100.ckpt.tmp"));

        layout.ensure_dirs().unwrap();
        assert!(layout.root().is_dir());
    }

    #[test]
    fn test_classify() {
        let label = CheckpointLabel::new(1, 5);
        assert_eq!(
            CheckpointLayout::classify("00000003_epoch00001_step00000005.ckpt"),
            Some(CheckpointFileKind::Full { seq: 3, label })
        );
        assert_eq!(
            CheckpointLayout::classify("epoch1_step5_fp16.ckpt"),
            Some(CheckpointFileKind::Reduced { seq: 0, label })
        );
        assert_eq!(
            CheckpointLayout::classify(".00000003_epoch00001_step00000005.ckpt.tmp"),
            None
        );
        assert_eq!(CheckpointLayout::classify("3_epoch1_stepX.ckpt"), None);
        assert_eq!(CheckpointLayout::classify("comparison.ppm"), None);
        assert_eq!(CheckpointLayout::classify("notes.ckpt"), None);
    }

    #[test]
    fn test_file_name_round_trips_through_classify() {
        let kind = CheckpointFileKind::Reduced { seq: 12, label: CheckpointLabel::new(0, 40) };
        assert_eq!(kind.file_name(), "00000012_epoch00000_step00000040_fp16.ckpt");
        assert_eq!(CheckpointLayout::classify(&kind.file_name()), Some(kind));
    }
}
