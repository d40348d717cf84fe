//! Shared fixtures for kiln-training integration tests.

#![allow(dead_code)]

use kiln_abstraction::{
    Batch, Device, ForwardOutput, ModelError, Parameter, Precision, Tensor, TrainableModel,
};
use kiln_training::{PrecisionConfig, TrainingConfig, TrainingError, TrainingResult};
use std::path::Path;

/// Quadratic bowl: `loss = mean((w - input)^2)`, gradient `2 (w - input) / n`.
///
/// Scaled gradients are rounded through the forward precision, so a large
/// loss scale overflows in fp16.
///
/// Generation returns a 2x2 tile filled with `tanh(w[0])`. Generation can be
/// made to fail from a given call onwards, and mode switches are recorded.
#[derive(Debug, Clone)]
pub struct QuadraticModel {
    pub weight: Parameter,
    pub training: bool,
    pub mode_switches: Vec<bool>,
    pub generate_calls: usize,
    pub fail_generate_from: Option<usize>,
    pending: Option<(Vec<f32>, Precision)>,
}

impl QuadraticModel {
    pub fn new(init: Vec<f32>) -> Self {
        Self {
            weight: Parameter::new("w", Tensor::vector(init)),
            training: true,
            mode_switches: Vec::new(),
            generate_calls: 0,
            fail_generate_from: None,
            pending: None,
        }
    }
}

impl TrainableModel for QuadraticModel {
    fn forward(
        &mut self,
        batch: &Batch,
        precision: Precision,
    ) -> Result<ForwardOutput, ModelError> {
        let input = batch.require("input")?;
        if input.len() != self.weight.value.len() {
            return Err(ModelError::InvalidInput("width mismatch".to_string()));
        }
        let diffs: Vec<f32> = self
            .weight
            .value
            .data()
            .iter()
            .zip(input.data())
            .map(|(w, x)| precision.round(w - x))
            .collect();
        let loss = diffs.iter().map(|d| d * d).sum::<f32>() / diffs.len() as f32;
        self.pending = Some((diffs, precision));
        Ok(ForwardOutput::new(loss).with_metric("width", self.weight.value.len() as f64))
    }

    fn backward(&mut self, loss_scale: f32) -> Result<(), ModelError> {
        let (diffs, precision) = self.pending.take().ok_or(ModelError::NoForwardPass)?;
        let n = diffs.len() as f32;
        for (g, d) in self.weight.grad.iter_mut().zip(diffs) {
            *g += precision.round(loss_scale * 2.0 * d / n);
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight]
    }

    fn generate(&mut self, _input: &Tensor) -> Result<Tensor, ModelError> {
        let call = self.generate_calls;
        self.generate_calls += 1;
        if self.fail_generate_from.is_some_and(|from| call >= from) {
            return Err(ModelError::Generation(format!("scripted failure on call {call}")));
        }
        let v = self.weight.value.data()[0].tanh();
        Tensor::new(vec![2, 2], vec![v; 4])
    }

    fn set_train_mode(&mut self) {
        self.training = true;
        self.mode_switches.push(true);
    }

    fn set_eval_mode(&mut self) {
        self.training = false;
        self.mode_switches.push(false);
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Full-precision config rooted at `root` with the given retention and interval.
pub fn config(root: &Path, retention: usize, interval: u64) -> TrainingConfig {
    let mut config = TrainingConfig::new(
        Device::Cpu,
        root.join("checkpoints"),
        root.join("logs").join("train.csv"),
        0.0,
        10.0,
    );
    config.retention = retention;
    config.checkpoint_interval = interval;
    config.optimizer.learning_rate = 0.05;
    config.precision = PrecisionConfig { mode: Precision::Full, ..PrecisionConfig::default() };
    config
}

pub fn batch(x: f32) -> Batch {
    Batch::new().with("input", Tensor::vector(vec![x, -x]))
}

/// `n` good batches.
pub fn batches(n: usize) -> Vec<TrainingResult<Batch>> {
    (0..n).map(|i| Ok(batch((i % 7) as f32 * 0.1))).collect()
}

/// `n` batches where the one at `fail_at` is a data error.
pub fn batches_failing_at(n: usize, fail_at: usize) -> Vec<TrainingResult<Batch>> {
    (0..n)
        .map(|i| {
            if i == fail_at {
                Err(TrainingError::Data(format!("corrupt record at {i}")))
            } else {
                Ok(batch((i % 7) as f32 * 0.1))
            }
        })
        .collect()
}
