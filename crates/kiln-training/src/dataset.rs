//! JSON Lines batch source.
//!
//! Each non-blank line is one batch: an object mapping tensor names to
//! `{"shape": [...], "data": [...]}`. The file is read lazily, one line per
//! `next()`, so a malformed line surfaces mid-epoch rather than up front.

use crate::error::{TrainingError, TrainingResult};
use kiln_abstraction::{Batch, Tensor};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

/// A finite, single-pass sequence of batches. Open a new one for each epoch.
#[derive(Debug)]
pub struct JsonlBatches {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl JsonlBatches {
    pub fn open(path: impl Into<PathBuf>) -> TrainingResult<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| TrainingError::storage(&path, e))?;
        Ok(Self { path, lines: BufReader::new(file).lines(), line_no: 0 })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for JsonlBatches {
    type Item = TrainingResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(TrainingError::storage(&self.path, e))),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(parse_batch(&line).map_err(|e| {
                TrainingError::Data(format!("{}:{}: {e}", self.path.display(), self.line_no))
            }));
        }
    }
}

/// Parses one JSONL line into a batch.
pub fn parse_batch(line: &str) -> Result<Batch, serde_json::Error> {
    let tensors: BTreeMap<String, Tensor> = serde_json::from_str(line)?;
    Ok(Batch::from(tensors))
}

/// Reads every line of `path` as a standalone tensor, e.g. conditioning samples.
pub fn read_jsonl_tensors(path: &Path) -> TrainingResult<Vec<Tensor>> {
    let contents = std::fs::read_to_string(path).map_err(|e| TrainingError::storage(path, e))?;
    let mut tensors = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tensor: Tensor = serde_json::from_str(line).map_err(|e| {
            TrainingError::Data(format!("failed to parse jsonl line {}: {}", idx + 1, e))
        })?;
        tensors.push(tensor);
    }
    Ok(tensors)
}

/// Content hash of a data file, recorded in run manifests.
pub fn compute_dataset_id(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path).map_err(|e| TrainingError::storage(path, e))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
