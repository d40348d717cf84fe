use crate::checkpoint::CheckpointRef;
use kiln_abstraction::ModelError;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    /// I/O failure on a checkpoint, log or artifact path.
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt checkpoint {label}: {reason}")]
    CorruptCheckpoint { label: String, reason: String },

    #[error("metrics log is closed")]
    ClosedLog,

    #[error("data error: {0}")]
    Data(String),

    /// Non-finite task loss. Gradient overflow is not an error; see `StepOutcome`.
    #[error("numeric error: {0}")]
    Numeric(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("training interrupted: {cause} ({rollback})")]
    Interrupted {
        #[source]
        cause: Box<TrainingError>,
        rollback: Rollback,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl TrainingError {
    pub(crate) fn storage(path: &Path, source: impl Into<std::io::Error>) -> Self {
        Self::Storage { path: path.to_path_buf(), source: source.into() }
    }

    pub(crate) fn corrupt(label: &str, reason: impl fmt::Display) -> Self {
        Self::CorruptCheckpoint { label: label.to_string(), reason: reason.to_string() }
    }

    /// The rollback outcome if this is an interrupted-epoch error.
    #[must_use]
    pub fn rollback(&self) -> Option<&Rollback> {
        match self {
            Self::Interrupted { rollback, .. } => Some(rollback),
            _ => None,
        }
    }
}

/// What the recovery protocol managed to do after a failed step.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollback {
    /// The latest checkpoint was found and loaded into the model.
    Restored(CheckpointRef),
    /// The store held no checkpoint to roll back to.
    NoCheckpoint,
    /// A checkpoint was found but could not be applied.
    Failed { label: String, reason: String },
}

impl fmt::Display for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restored(ckpt) => write!(f, "rolled back to checkpoint {}", ckpt.label),
            Self::NoCheckpoint => write!(f, "no checkpoint found, model state not rolled back"),
            Self::Failed { label, reason } => {
                write!(f, "rollback to checkpoint {label} failed: {reason}")
            }
        }
    }
}
