//! Durable, append-only CSV record of training steps.
//!
//! One writer per file. Every `append` is flushed and synced before it
//! returns, so a crash right after it cannot lose the record.

use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const HEADER: [&str; 5] = ["timestamp", "epoch", "step", "loss", "metrics"];

/// One row of the metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLogRecord {
    pub timestamp: DateTime<Utc>,
    pub epoch: u64,
    pub step: u64,
    pub loss: f64,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug)]
pub struct MetricsLog {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl MetricsLog {
    /// Opens `path` for appending, creating it and its parent directory if needed.
    ///
    /// The header row is written only when the file is empty.
    pub fn open(path: impl Into<PathBuf>) -> TrainingResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TrainingError::storage(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrainingError::storage(&path, e))?;
        let is_empty = file.metadata().map_err(|e| TrainingError::storage(&path, e))?.len() == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_empty {
            writer.write_record(HEADER).map_err(|e| csv_storage(&path, e))?;
            sync(&mut writer, &path)?;
        }

        Ok(Self { path, writer: Some(writer) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Appends one record stamped with the current time.
    pub fn append(
        &mut self,
        epoch: u64,
        step: u64,
        loss: f64,
        metrics: &BTreeMap<String, f64>,
    ) -> TrainingResult<()> {
        let writer = self.writer.as_mut().ok_or(TrainingError::ClosedLog)?;

        let timestamp = Utc::now().to_rfc3339();
        let row = [
            timestamp,
            epoch.to_string(),
            step.to_string(),
            loss.to_string(),
            format_metrics(metrics),
        ];
        writer.write_record(&row).map_err(|e| csv_storage(&self.path, e))?;
        sync(writer, &self.path)
    }

    /// Flushes and releases the file. Later appends fail with `ClosedLog`.
    pub fn close(&mut self) -> TrainingResult<()> {
        match self.writer.take() {
            Some(mut writer) => sync(&mut writer, &self.path),
            None => Ok(()),
        }
    }
}

impl Drop for MetricsLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to close metrics log");
        }
    }
}

fn sync(writer: &mut csv::Writer<File>, path: &Path) -> TrainingResult<()> {
    writer.flush().map_err(|e| TrainingError::storage(path, e))?;
    writer.get_ref().sync_data().map_err(|e| TrainingError::storage(path, e))
}

fn csv_storage(path: &Path, e: csv::Error) -> TrainingError {
    TrainingError::storage(path, std::io::Error::from(e))
}

/// `k=v` pairs joined by `;`, keys in sorted order.
#[must_use]
pub fn format_metrics(metrics: &BTreeMap<String, f64>) -> String {
    metrics.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(";")
}

pub fn parse_metrics(s: &str) -> TrainingResult<BTreeMap<String, f64>> {
    let mut out = BTreeMap::new();
    for pair in s.split(';').filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| TrainingError::Data(format!("malformed metric {pair:?}")))?;
        let value = v
            .parse()
            .map_err(|_| TrainingError::Data(format!("metric {k} has non-numeric value {v:?}")))?;
        out.insert(k.to_string(), value);
    }
    Ok(out)
}

/// Reads every record of the log at `path`, in write order.
pub fn read_records(path: &Path) -> TrainingResult<Vec<TrainingLogRecord>> {
    let file = File::open(path).map_err(|e| TrainingError::storage(path, e))?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let field = |i: usize| row.get(i).unwrap_or_default();
        let timestamp = DateTime::parse_from_rfc3339(field(0))
            .map_err(|e| TrainingError::Data(format!("bad timestamp {:?}: {e}", field(0))))?
            .with_timezone(&Utc);
        let number_err = |name: &str| TrainingError::Data(format!("bad {name} in metrics log row"));

        records.push(TrainingLogRecord {
            timestamp,
            epoch: field(1).parse().map_err(|_| number_err("epoch"))?,
            step: field(2).parse().map_err(|_| number_err("step"))?,
            loss: field(3).parse().map_err(|_| number_err("loss"))?,
            metrics: parse_metrics(field(4))?,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metrics() -> BTreeMap<String, f64> {
        [("task_loss".to_string(), 0.5), ("loss_scale".to_string(), 65536.0)].into()
    }

    #[test]
    fn test_append_then_reopen_sees_record() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs").join("train.csv");

        let mut log = MetricsLog::open(&path).unwrap();
        log.append(0, 0, 1.25, &metrics()).unwrap();
        assert_eq!(read_records(&path).unwrap().len(), 1);

        log.append(0, 1, 0.75, &BTreeMap::new()).unwrap();
        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].metrics, metrics());
        assert_eq!(records[1].step, 1);
        assert!((records[1].loss - 0.75).abs() < f64::EPSILON);
        assert!(records[1].metrics.is_empty());
    }

    #[test]
    fn test_header_written_once_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.csv");

        MetricsLog::open(&path).unwrap().append(0, 0, 1.0, &metrics()).unwrap();
        MetricsLog::open(&path).unwrap().append(1, 0, 2.0, &metrics()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("timestamp,epoch,step,loss,metrics").count(), 1);
        assert_eq!(read_records(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_append_after_close_fails() {
        let temp = TempDir::new().unwrap();
        let mut log = MetricsLog::open(temp.path().join("train.csv")).unwrap();
        log.close().unwrap();
        assert!(!log.is_open());
        assert!(matches!(log.append(0, 0, 1.0, &metrics()), Err(TrainingError::ClosedLog)));
        log.close().unwrap();
    }

    #[test]
    fn test_metrics_format_is_sorted() {
        assert_eq!(format_metrics(&metrics()), "loss_scale=65536;task_loss=0.5");
        assert_eq!(parse_metrics("loss_scale=65536;task_loss=0.5").unwrap(), metrics());
        assert!(parse_metrics("novalue").is_err());
    }

    #[test]
    fn test_open_in_missing_parent_that_is_a_file_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("blocker"), "x").unwrap();
        let err = MetricsLog::open(temp.path().join("blocker").join("train.csv")).unwrap_err();
        assert!(matches!(err, TrainingError::Storage { .. }));
    }
}
