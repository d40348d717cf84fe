//! Parameter update rules.

use crate::config::OptimizerConfig;
use kiln_abstraction::Parameter;

/// An optimization algorithm applied to a model's named parameters.
pub trait Optimizer: Send {
    /// Applies one update from the parameters' (already unscaled) gradients.
    fn step(&mut self, params: &mut [&mut Parameter]);

    /// Clears every gradient buffer.
    fn zero_grad(&mut self, params: &mut [&mut Parameter]) {
        for param in params.iter_mut() {
            param.zero_grad();
        }
    }

    /// Drops any per-parameter history, e.g. after the model was rolled back.
    fn reset(&mut self) {}

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocities: Vec<Vec<f32>>,
}

impl Sgd {
    #[must_use]
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self { lr, momentum, velocities: Vec::new() }
    }

    #[must_use]
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self::new(config.learning_rate, config.momentum)
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        if self.momentum > 0.0 && self.velocities.len() != params.len() {
            self.velocities = params.iter().map(|p| vec![0.0; p.grad.len()]).collect();
        }

        for (i, param) in params.iter_mut().enumerate() {
            let Parameter { value, grad, .. } = &mut **param;
            if self.momentum > 0.0 {
                // v = momentum * v - lr * g; p += v
                let velocity = &mut self.velocities[i];
                let lanes = value.data_mut().iter_mut().zip(grad.iter()).zip(velocity.iter_mut());
                for ((p, g), v) in lanes {
                    *v = self.momentum * *v - self.lr * g;
                    *p += *v;
                }
            } else {
                for (p, g) in value.data_mut().iter_mut().zip(grad.iter()) {
                    *p -= self.lr * g;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.velocities.clear();
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
