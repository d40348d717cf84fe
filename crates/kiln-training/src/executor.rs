//! One optimization step under dynamic loss scaling.

use crate::config::TrainingConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::optimizer::Optimizer;
use crate::scaler::LossScaler;
use kiln_abstraction::{Batch, Precision, TrainableModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What one step did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// `task_loss + l2_penalty`, unscaled.
    pub loss: f32,
    pub task_loss: f32,
    pub l2_penalty: f32,
    /// Gradients were non-finite; the update was skipped.
    pub overflowed: bool,
    /// Scale the backward pass ran with.
    pub loss_scale: f32,
    /// Extra metrics reported by the model's forward pass.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl StepOutcome {
    /// Flat metrics row for the log: the model's metrics plus step telemetry.
    #[must_use]
    pub fn log_metrics(&self) -> BTreeMap<String, f64> {
        let mut out = self.metrics.clone();
        out.insert("task_loss".to_string(), f64::from(self.task_loss));
        out.insert("l2_penalty".to_string(), f64::from(self.l2_penalty));
        out.insert("loss_scale".to_string(), f64::from(self.loss_scale));
        out.insert("overflow".to_string(), if self.overflowed { 1.0 } else { 0.0 });
        out
    }
}

/// Runs forward, regularized loss, scaled backward and update.
///
/// Holds the run's loss-scale state; the driver owns one executor per run.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    precision: Precision,
    l2_coef: f32,
    scaler: LossScaler,
}

impl StepExecutor {
    #[must_use]
    pub fn new(precision: Precision, l2_coef: f32, scaler: LossScaler) -> Self {
        Self { precision, l2_coef, scaler }
    }

    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.precision.mode, config.l2_coef, LossScaler::from_config(&config.precision))
    }

    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    #[must_use]
    pub fn l2_coef(&self) -> f32 {
        self.l2_coef
    }

    #[must_use]
    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }

    /// Executes one step on `batch`.
    ///
    /// A gradient overflow is not an error: the update is skipped, the scale
    /// backs off, and the outcome is flagged. A non-finite loss is a
    /// `Numeric` error. Gradients are zero when this returns, on every path.
    pub fn step<M>(
        &mut self,
        model: &mut M,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
    ) -> TrainingResult<StepOutcome>
    where
        M: TrainableModel + ?Sized,
    {
        let result = self.try_step(model, batch, optimizer);
        if result.is_err() {
            optimizer.zero_grad(&mut model.parameters_mut());
        }
        result
    }

    fn try_step<M>(
        &mut self,
        model: &mut M,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
    ) -> TrainingResult<StepOutcome>
    where
        M: TrainableModel + ?Sized,
    {
        let output = model.forward(batch, self.precision)?;
        let task_loss = output.loss;
        if !task_loss.is_finite() {
            return Err(TrainingError::Numeric(format!("task loss is {task_loss}")));
        }

        let l2_penalty = self.l2_penalty(model);
        let loss = task_loss + l2_penalty;
        if !loss.is_finite() {
            return Err(TrainingError::Numeric(format!(
                "regularized loss is {loss} (l2 penalty {l2_penalty})"
            )));
        }

        let loss_scale = self.scaler.scale();
        model.backward(loss_scale)?;

        let mut params = model.parameters_mut();
        if self.l2_coef != 0.0 {
            // d(l2 * p^2)/dp, scaled like the task gradient
            let factor = 2.0 * self.l2_coef * loss_scale;
            for param in &mut params {
                let values = param.value.data().to_vec();
                for (g, p) in param.grad.iter_mut().zip(values) {
                    *g += factor * p;
                }
            }
        }

        let valid = self.scaler.unscale_and_check(&mut params);
        if valid {
            optimizer.step(&mut params);
        } else {
            tracing::debug!(loss_scale, "Gradient overflow, skipping update");
        }
        optimizer.zero_grad(&mut params);
        self.scaler.update(valid);

        Ok(StepOutcome {
            loss,
            task_loss,
            l2_penalty,
            overflowed: !valid,
            loss_scale,
            metrics: output.metrics,
        })
    }

    fn l2_penalty<M>(&self, model: &M) -> f32
    where
        M: TrainableModel + ?Sized,
    {
        if self.l2_coef == 0.0 {
            return 0.0;
        }
        let sum: f64 = model.parameters().iter().map(|p| p.value.sum_of_squares()).sum();
        (f64::from(self.l2_coef) * sum) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrecisionConfig;
    use crate::optimizer::Sgd;
    use kiln_abstraction::Tensor;
    use kiln_models::LinearModel;

    fn batch() -> Batch {
        Batch::new()
            .with("input", Tensor::vector(vec![1.0, 2.0]))
            .with("target", Tensor::vector(vec![0.5]))
    }

    fn executor(l2_coef: f32, precision: PrecisionConfig) -> StepExecutor {
        StepExecutor::new(precision.mode, l2_coef, LossScaler::from_config(&precision))
    }

    fn full() -> PrecisionConfig {
        PrecisionConfig { mode: Precision::Full, ..PrecisionConfig::default() }
    }

    #[test]
    fn test_zero_l2_reports_raw_task_loss() {
        let mut model = LinearModel::new(2, 1, 7);
        let mut reference = model.clone();
        let expected = reference.forward(&batch(), Precision::Full).unwrap().loss;

        let mut exec = executor(0.0, full());
        let outcome = exec.step(&mut model, &batch(), &mut Sgd::new(0.1, 0.0)).unwrap();
        assert_eq!(outcome.loss.to_bits(), expected.to_bits());
        assert_eq!(outcome.l2_penalty.to_bits(), 0.0_f32.to_bits());
    }

    #[test]
    fn test_l2_term_added_to_loss() {
        let mut model = LinearModel::new(2, 1, 7);
        let sum: f64 = model.parameters().iter().map(|p| p.value.sum_of_squares()).sum();

        let mut exec = executor(0.5, full());
        let outcome = exec.step(&mut model, &batch(), &mut Sgd::new(0.1, 0.0)).unwrap();
        assert!((f64::from(outcome.l2_penalty) - 0.5 * sum).abs() < 1e-5);
        assert!((outcome.loss - (outcome.task_loss + outcome.l2_penalty)).abs() < 1e-6);
    }

    #[test]
    fn test_successful_step_updates_and_clears_grads() {
        let mut model = LinearModel::new(2, 1, 7);
        let before = model.state();

        let precision = PrecisionConfig { initial_scale: 1024.0, ..PrecisionConfig::default() };
        let mut exec = executor(0.01, precision);
        let outcome = exec.step(&mut model, &batch(), &mut Sgd::new(0.1, 0.0)).unwrap();
        assert!(!outcome.overflowed);
        assert_ne!(model.state(), before);
        assert!(model.parameters().iter().all(|p| p.grad.iter().all(|g| *g == 0.0)));
    }

    #[test]
    fn test_overflow_skips_update_and_backs_off() {
        let mut model = LinearModel::new(2, 1, 7);
        let before = model.state();

        // fp16 tops out near 65504, so this scale overflows every gradient
        let precision = PrecisionConfig { initial_scale: 1.0e9, ..PrecisionConfig::default() };
        let mut exec = executor(0.0, precision);
        let outcome = exec.step(&mut model, &batch(), &mut Sgd::new(0.1, 0.0)).unwrap();

        assert!(outcome.overflowed);
        assert!(outcome.loss.is_finite());
        assert!((outcome.loss_scale - 1.0e9).abs() < 1.0);
        assert!((exec.scaler().scale() - 5.0e8).abs() < 1.0);
        assert_eq!(model.state(), before);
        assert!(model.parameters().iter().all(|p| p.grad.iter().all(|g| *g == 0.0)));
    }

    #[test]
    fn test_non_finite_loss_is_numeric_error() {
        let mut model = LinearModel::new(2, 1, 7);
        let bad = Batch::new()
            .with("input", Tensor::vector(vec![f32::NAN, 0.0]))
            .with("target", Tensor::vector(vec![0.0]));

        let mut exec = executor(0.0, full());
        let err = exec.step(&mut model, &bad, &mut Sgd::new(0.1, 0.0)).unwrap_err();
        assert!(matches!(err, TrainingError::Numeric(_)));
    }

    #[test]
    fn test_model_error_surfaces() {
        let mut model = LinearModel::new(2, 1, 7);
        let mut exec = executor(0.0, full());
        let err = exec.step(&mut model, &Batch::new(), &mut Sgd::new(0.1, 0.0)).unwrap_err();
        assert!(matches!(err, TrainingError::Model(_)));
    }

    #[test]
    fn test_log_metrics_include_telemetry() {
        let outcome = StepOutcome {
            loss: 1.0,
            task_loss: 0.75,
            l2_penalty: 0.25,
            overflowed: true,
            loss_scale: 8.0,
            metrics: [("mae".to_string(), 0.5)].into(),
        };
        let m = outcome.log_metrics();
        assert_eq!(m.len(), 5);
        assert!((m["overflow"] - 1.0).abs() < f64::EPSILON);
        assert!((m["loss_scale"] - 8.0).abs() < f64::EPSILON);
    }
}
