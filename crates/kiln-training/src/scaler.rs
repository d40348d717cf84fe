//! Dynamic loss scaling for reduced-precision training.

use crate::config::PrecisionConfig;
use kiln_abstraction::Parameter;
use serde::{Deserialize, Serialize};

/// Loss-scale state owned by one training run.
///
/// The scale is multiplied into the loss before backward. An overflowing step
/// backs the scale off (never below `min_scale`); `growth_interval` clean steps
/// in a row grow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u64,
    min_scale: f32,
    /// Whether the scale adapts; a full-precision run keeps it at 1.
    dynamic: bool,
    steps_since_growth: u64,
    overflow_count: u64,
    successful_steps: u64,
}

impl LossScaler {
    #[must_use]
    pub fn from_config(config: &PrecisionConfig) -> Self {
        let dynamic = config.mode.is_reduced();
        Self {
            scale: if dynamic { config.initial_scale } else { 1.0 },
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            min_scale: config.min_scale,
            dynamic,
            steps_since_growth: 0,
            overflow_count: 0,
            successful_steps: 0,
        }
    }

    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    #[must_use]
    pub fn successful_steps(&self) -> u64 {
        self.successful_steps
    }

    /// Divides every gradient by the current scale.
    ///
    /// Returns `false` if any unscaled gradient is non-finite.
    pub fn unscale_and_check(&self, params: &mut [&mut Parameter]) -> bool {
        let inv_scale = 1.0 / self.scale;
        let mut finite = true;
        for param in params.iter_mut() {
            for g in &mut param.grad {
                *g *= inv_scale;
                finite &= g.is_finite();
            }
        }
        finite
    }

    /// Records the outcome of a step and adjusts the scale.
    pub fn update(&mut self, grads_valid: bool) {
        if grads_valid {
            self.successful_steps += 1;
        } else {
            self.overflow_count += 1;
        }
        if !self.dynamic {
            return;
        }

        if grads_valid {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.growth_interval {
                let grown = self.scale * self.growth_factor;
                if grown.is_finite() {
                    tracing::debug!(from = self.scale, to = grown, "Growing loss scale");
                    self.scale = grown;
                }
                self.steps_since_growth = 0;
            }
        } else {
            let reduced = (self.scale * self.backoff_factor).max(self.min_scale);
            tracing::debug!(
                from = self.scale,
                to = reduced,
                "Backing off loss scale after overflow"
            );
            self.scale = reduced;
            self.steps_since_growth = 0;
        }
    }
}
