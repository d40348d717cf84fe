//! Kiln Training
//!
//! Training orchestration and checkpoint lifecycle for a `TrainableModel`:
//! - A capacity-bounded checkpoint store (`CheckpointStore`)
//! - A durable, append-only metrics log (`MetricsLog`)
//! - A precision-scaled step executor with L2 regularization (`StepExecutor`)
//! - An epoch driver that rolls back to the latest checkpoint on failure (`TrainingDriver`)
//! - Comparison grids and reduced-precision exports (`evaluation`)

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod evaluation;
pub mod executor;
pub mod layout;
pub mod metrics_log;
pub mod optimizer;
pub mod progress;
pub mod scaler;
pub mod snapshot;

pub use artifacts::{sha256_file, ArtifactKind, TrainingArtifact, TrainingManifest};
pub use checkpoint::{CheckpointLabel, CheckpointRef, CheckpointStore};
pub use config::{OptimizerConfig, PrecisionConfig, TrainingConfig};
pub use dataset::{compute_dataset_id, read_jsonl_tensors, JsonlBatches};
pub use driver::{EpochOutcome, EpochSummary, TrainingDriver};
pub use error::{Rollback, TrainingError, TrainingResult};
pub use evaluation::{compare, export_reduced_precision};
pub use executor::{StepExecutor, StepOutcome};
pub use layout::CheckpointLayout;
pub use metrics_log::{read_records, MetricsLog, TrainingLogRecord};
pub use optimizer::{Optimizer, Sgd};
pub use progress::{NullProgressSink, ProgressEvent, ProgressSink, TracingProgressSink};
pub use scaler::LossScaler;
pub use snapshot::StorageDtype;
