//! Epoch loop, periodic checkpointing and rollback on failure.

use crate::checkpoint::{CheckpointLabel, CheckpointRef, CheckpointStore};
use crate::config::TrainingConfig;
use crate::error::{Rollback, TrainingError, TrainingResult};
use crate::executor::{StepExecutor, StepOutcome};
use crate::metrics_log::MetricsLog;
use crate::optimizer::{Optimizer, Sgd};
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink};
use kiln_abstraction::{Batch, TrainableModel};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: u64,
    /// Total loss over `steps`; 0.0 for an empty epoch.
    pub mean_loss: f64,
    /// Batches attempted, overflowed steps included.
    pub steps: u64,
    pub overflow_steps: u64,
    /// Checkpoints saved during the epoch; older ones may have rotated out.
    pub checkpoints: Vec<CheckpointRef>,
}

/// How a call to [`TrainingDriver::run_epoch`] ended.
#[derive(Debug)]
pub enum EpochOutcome {
    Completed(EpochSummary),
    /// A step failed and the model was rolled back to `restored`.
    Recovered { error: TrainingError, restored: CheckpointRef },
    /// A step failed and the model could not be rolled back.
    Unrecoverable { error: TrainingError, rollback: Rollback },
}

impl EpochOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    #[must_use]
    pub fn summary(&self) -> Option<&EpochSummary> {
        match self {
            Self::Completed(summary) => Some(summary),
            _ => None,
        }
    }

    /// The error that interrupted the epoch, if any.
    #[must_use]
    pub fn error(&self) -> Option<&TrainingError> {
        match self {
            Self::Completed(_) => None,
            Self::Recovered { error, .. } | Self::Unrecoverable { error, .. } => Some(error),
        }
    }

    /// Turns either failure arm into `TrainingError::Interrupted`.
    pub fn into_result(self) -> TrainingResult<EpochSummary> {
        match self {
            Self::Completed(summary) => Ok(summary),
            Self::Recovered { error, restored } => Err(TrainingError::Interrupted {
                cause: Box::new(error),
                rollback: Rollback::Restored(restored),
            }),
            Self::Unrecoverable { error, rollback } => {
                Err(TrainingError::Interrupted { cause: Box::new(error), rollback })
            }
        }
    }
}

/// Owns one training run: the model, its optimizer and loss-scale state, the
/// checkpoint store and the metrics log.
///
/// The model is mutated only through the driver, so updates and restores never
/// overlap. Concurrent runs need distinct drivers, models and directories.
pub struct TrainingDriver<M: TrainableModel> {
    config: TrainingConfig,
    model: M,
    optimizer: Box<dyn Optimizer>,
    executor: StepExecutor,
    store: CheckpointStore,
    log: MetricsLog,
    progress: Arc<dyn ProgressSink>,
}

impl<M: TrainableModel> TrainingDriver<M> {
    /// Validates `config`, opens the checkpoint store and the metrics log.
    pub fn new(config: TrainingConfig, model: M) -> TrainingResult<Self> {
        config.validate()?;
        let store = CheckpointStore::open(&config.checkpoint_dir, config.retention)?;
        let log = MetricsLog::open(&config.log_path)?;
        let optimizer: Box<dyn Optimizer> = Box::new(Sgd::from_config(&config.optimizer));
        let executor = StepExecutor::from_config(&config);

        info!(
            device = %config.device,
            checkpoint_dir = %config.checkpoint_dir.display(),
            precision = %config.precision.mode,
            "Training driver ready"
        );

        Ok(Self {
            config,
            model,
            optimizer,
            executor,
            store,
            log,
            progress: Arc::new(NullProgressSink),
        })
    }

    #[must_use]
    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// Runs one epoch over `source`, which must be a fresh sequence.
    ///
    /// Any failure (a data error from the source, a model or numeric error, a
    /// log or checkpoint write failure) aborts the epoch after rolling the
    /// model back to the latest checkpoint. The failure is always returned.
    pub fn run_epoch<I>(&mut self, source: I, epoch: u64) -> EpochOutcome
    where
        I: IntoIterator<Item = TrainingResult<Batch>>,
    {
        self.progress.on_event(ProgressEvent::EpochStarted { epoch });

        let mut total_loss = 0.0_f64;
        let mut steps = 0_u64;
        let mut overflow_steps = 0_u64;
        let mut checkpoints = Vec::new();

        for (step, item) in (0_u64..).zip(source) {
            steps += 1;
            match self.run_step(epoch, step, item) {
                Ok((outcome, saved)) => {
                    total_loss += f64::from(outcome.loss);
                    if outcome.overflowed {
                        overflow_steps += 1;
                    }
                    checkpoints.extend(saved);
                }
                Err(error) => return self.recover(epoch, step, error),
            }
        }

        let mean_loss = if steps == 0 { 0.0 } else { total_loss / steps as f64 };
        info!(epoch, steps, mean_loss, overflow_steps, "Epoch completed");
        self.progress.on_event(ProgressEvent::EpochFinished { epoch, steps, mean_loss });

        EpochOutcome::Completed(EpochSummary {
            epoch,
            mean_loss,
            steps,
            overflow_steps,
            checkpoints,
        })
    }

    fn run_step(
        &mut self,
        epoch: u64,
        step: u64,
        item: TrainingResult<Batch>,
    ) -> TrainingResult<(StepOutcome, Option<CheckpointRef>)> {
        let batch = item?.to_device(self.config.device);
        let outcome = self.executor.step(&mut self.model, &batch, self.optimizer.as_mut())?;

        self.log.append(epoch, step, f64::from(outcome.loss), &outcome.log_metrics())?;
        self.progress.on_event(ProgressEvent::Step {
            epoch,
            step,
            loss: outcome.loss,
            overflowed: outcome.overflowed,
        });

        let saved = if step % self.config.checkpoint_interval == 0 {
            let ckpt = self.store.save_model(&self.model, CheckpointLabel::new(epoch, step))?;
            self.progress.on_event(ProgressEvent::CheckpointSaved {
                epoch,
                step,
                label: ckpt.label.to_string(),
            });
            Some(ckpt)
        } else {
            None
        };

        Ok((outcome, saved))
    }

    fn recover(&mut self, epoch: u64, step: u64, error: TrainingError) -> EpochOutcome {
        warn!(epoch, step, error = %error, "Training step failed, rolling back");

        let rollback = match self.store.latest() {
            Ok(Some(ckpt)) => match self.store.restore(&mut self.model, &ckpt) {
                Ok(()) => {
                    self.optimizer.reset();
                    Rollback::Restored(ckpt)
                }
                Err(e) => {
                    warn!(label = %ckpt.label, error = %e, "Rollback failed");
                    Rollback::Failed { label: ckpt.label.to_string(), reason: e.to_string() }
                }
            },
            Ok(None) => Rollback::NoCheckpoint,
            Err(e) => {
                warn!(error = %e, "Could not look up a checkpoint to roll back to");
                Rollback::Failed { label: "latest".to_string(), reason: e.to_string() }
            }
        };

        self.progress.on_event(ProgressEvent::RolledBack {
            epoch,
            step,
            label: match &rollback {
                Rollback::Restored(ckpt) => Some(ckpt.label.to_string()),
                _ => None,
            },
            error: error.to_string(),
        });

        match rollback {
            Rollback::Restored(restored) => EpochOutcome::Recovered { error, restored },
            rollback => EpochOutcome::Unrecoverable { error, rollback },
        }
    }

    /// Closes the metrics log and hands the model back.
    pub fn finish(mut self) -> TrainingResult<M> {
        self.log.close()?;
        Ok(self.model)
    }
}
