//! Dense linear model with analytic gradients.

use kiln_abstraction::{
    Batch, ForwardOutput, ModelError, Parameter, Precision, Tensor, TrainableModel,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const WEIGHT: &str = "weight";
const BIAS: &str = "bias";

/// `y = W x + b`, trained against `target` with mean squared error.
///
/// Batches carry an `input` tensor of shape `[in]` or `[rows, in]` and a
/// `target` tensor holding `rows * out` elements. In reduced precision the
/// inputs, weights, outputs and scaled gradients are rounded through the
/// target format, so an oversized loss scale overflows the same way it does
/// on real half-precision hardware.
#[derive(Debug, Clone)]
pub struct LinearModel {
    weight: Parameter,
    bias: Parameter,
    output_shape: Option<Vec<usize>>,
    training: bool,
    pending: Option<ForwardCache>,
}

#[derive(Debug, Clone)]
struct ForwardCache {
    inputs: Vec<f32>,
    residuals: Vec<f32>,
    rows: usize,
    precision: Precision,
}

impl LinearModel {
    /// Creates a model with weights drawn uniformly from `±1/sqrt(in)`.
    #[must_use]
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let weights = (0..in_features * out_features)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();

        Self {
            weight: Parameter::new(
                WEIGHT,
                Tensor::new(vec![out_features, in_features], weights)
                    .unwrap_or_else(|_| Tensor::zeros(vec![out_features, in_features])),
            ),
            bias: Parameter::new(BIAS, Tensor::zeros(vec![out_features])),
            output_shape: None,
            training: true,
            pending: None,
        }
    }

    /// Builder: reshape generated outputs, e.g. `[8, 8]` for a 64-wide model.
    pub fn with_output_shape(mut self, shape: Vec<usize>) -> Result<Self, ModelError> {
        let len: usize = shape.iter().product();
        if len != self.out_features() {
            return Err(ModelError::InvalidInput(format!(
                "output shape {:?} does not hold {} features",
                shape,
                self.out_features()
            )));
        }
        self.output_shape = Some(shape);
        Ok(self)
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.value.shape()[1]
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.value.shape()[0]
    }

    fn rows_of(&self, input: &Tensor) -> Result<usize, ModelError> {
        let width = self.in_features();
        match input.shape() {
            [n] if *n == width => Ok(1),
            [rows, n] if *n == width => Ok(*rows),
            other => Err(ModelError::InvalidInput(format!(
                "input shape {:?} does not match {} features",
                other, width
            ))),
        }
    }

    fn project(&self, x: &[f32], precision: Precision) -> Vec<f32> {
        let (width, out) = (self.in_features(), self.out_features());
        let w = self.weight.value.data();
        let b = self.bias.value.data();
        (0..out)
            .map(|o| {
                let acc = (0..width).fold(precision.round(b[o]), |acc, i| {
                    acc + precision.round(w[o * width + i]) * x[i]
                });
                precision.round(acc)
            })
            .collect()
    }
}

impl TrainableModel for LinearModel {
    fn forward(
        &mut self,
        batch: &Batch,
        precision: Precision,
    ) -> Result<ForwardOutput, ModelError> {
        let input = batch.require("input")?;
        let target = batch.require("target")?;
        let rows = self.rows_of(input)?;
        let (width, out) = (self.in_features(), self.out_features());

        if target.len() != rows * out {
            return Err(ModelError::InvalidInput(format!(
                "target has {} elements, expected {}",
                target.len(),
                rows * out
            )));
        }

        let inputs: Vec<f32> = input.data().iter().map(|v| precision.round(*v)).collect();
        let mut residuals = Vec::with_capacity(rows * out);
        for row in 0..rows {
            let y = self.project(&inputs[row * width..(row + 1) * width], precision);
            let t = &target.data()[row * out..(row + 1) * out];
            residuals.extend(y.iter().zip(t).map(|(y, t)| y - t));
        }

        let count = residuals.len().max(1) as f64;
        let mse = residuals.iter().map(|r| f64::from(*r) * f64::from(*r)).sum::<f64>() / count;
        let mae = residuals.iter().map(|r| f64::from(r.abs())).sum::<f64>() / count;

        self.pending = Some(ForwardCache { inputs, residuals, rows, precision });
        Ok(ForwardOutput::new(mse as f32).with_metric("mae", mae))
    }

    fn backward(&mut self, loss_scale: f32) -> Result<(), ModelError> {
        let cache = self.pending.take().ok_or(ModelError::NoForwardPass)?;
        let (width, out) = (self.in_features(), self.out_features());
        let denom = (cache.rows * out).max(1) as f32;
        let p = cache.precision;

        for row in 0..cache.rows {
            for o in 0..out {
                let g = p.round(loss_scale * 2.0 * cache.residuals[row * out + o] / denom);
                self.bias.grad[o] += g;
                for i in 0..width {
                    self.weight.grad[o * width + i] += p.round(g * cache.inputs[row * width + i]);
                }
            }
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn generate(&mut self, input: &Tensor) -> Result<Tensor, ModelError> {
        if input.len() != self.in_features() {
            return Err(ModelError::Generation(format!(
                "conditioning input has {} elements, expected {}",
                input.len(),
                self.in_features()
            )));
        }
        let y: Vec<f32> =
            self.project(input.data(), Precision::Full).into_iter().map(f32::tanh).collect();
        let shape = self.output_shape.clone().unwrap_or_else(|| vec![y.len()]);
        Tensor::new(shape, y)
    }

    fn set_train_mode(&mut self) {
        self.training = true;
    }

    fn set_eval_mode(&mut self) {
        self.training = false;
        self.pending = None;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}
