use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    EpochStarted { epoch: u64 },
    Step { epoch: u64, step: u64, loss: f32, overflowed: bool },
    CheckpointSaved { epoch: u64, step: u64, label: String },
    RolledBack { epoch: u64, step: u64, label: Option<String>, error: String },
    EpochFinished { epoch: u64, steps: u64, mean_loss: f64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// Forwards events to `tracing`; per-step events go to `trace`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::EpochStarted { epoch } => tracing::info!(epoch, "Epoch started"),
            ProgressEvent::Step { epoch, step, loss, overflowed } => {
                tracing::trace!(epoch, step, loss, overflowed, "Step finished");
            }
            ProgressEvent::CheckpointSaved { epoch, step, label } => {
                tracing::debug!(epoch, step, label = %label, "Checkpoint saved");
            }
            ProgressEvent::RolledBack { epoch, step, label, error } => match label {
                Some(label) => {
                    tracing::warn!(
                        epoch,
                        step,
                        label = %label,
                        error = %error,
                        "Rolled back after failed step"
                    );
                }
                None => {
                    tracing::warn!(
                        epoch,
                        step,
                        error = %error,
                        "Step failed with no checkpoint to roll back to"
                    );
                }
            },
            ProgressEvent::EpochFinished { epoch, steps, mean_loss } => {
                tracing::info!(epoch, steps, mean_loss, "Epoch finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(ProgressEvent::EpochStarted { epoch: 2 }).unwrap();
        assert_eq!(json["type"], "epoch_started");
        assert_eq!(json["epoch"], 2);
    }
}
