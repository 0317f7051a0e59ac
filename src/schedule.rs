use crate::error::{Error, Result};
use burn::prelude::*;

/// Configuration to create an [exponential learning-rate decay](ExponentialDecay).
///
/// `lr = initial_lr * decay_rate ^ (global_step / decay_steps)`
#[derive(Config, Debug)]
pub struct ExponentialDecayConfig {
    #[config(default = 0.01)]
    pub initial_lr: f64,
    #[config(default = 1000)]
    pub decay_steps: usize,
    /// A rate of 1.0 keeps the learning rate constant.
    #[config(default = 1.0)]
    pub decay_rate: f64,
    /// Decays in discrete steps, by truncating `global_step / decay_steps`.
    #[config(default = true)]
    pub staircase: bool,
}

impl ExponentialDecayConfig {
    pub fn init(&self) -> Result<ExponentialDecay> {
        if self.decay_steps == 0 {
            return Err(Error::Config("decay_steps must be at least 1".into()));
        }
        if !(self.initial_lr.is_finite() && self.initial_lr > 0.) {
            return Err(Error::Config(format!(
                "initial_lr must be positive, got {}",
                self.initial_lr
            )));
        }
        if !(self.decay_rate.is_finite() && self.decay_rate > 0.) {
            return Err(Error::Config(format!(
                "decay_rate must be positive, got {}",
                self.decay_rate
            )));
        }
        Ok(ExponentialDecay {
            initial_lr: self.initial_lr,
            decay_steps: self.decay_steps,
            decay_rate: self.decay_rate,
            staircase: self.staircase,
            global_step: 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialDecay {
    initial_lr: f64,
    decay_steps: usize,
    decay_rate: f64,
    staircase: bool,
    global_step: usize,
}

impl ExponentialDecay {
    /// Learning rate in effect at `step`.
    pub fn lr_at(&self, step: usize) -> f64 {
        let exponent = if self.staircase {
            (step / self.decay_steps) as f64
        } else {
            step as f64 / self.decay_steps as f64
        };
        self.initial_lr * self.decay_rate.powf(exponent)
    }

    /// Returns the learning rate for the current step, then advances to the next one.
    pub fn step(&mut self) -> f64 {
        let lr = self.lr_at(self.global_step);
        self.global_step += 1;
        lr
    }

    /// Number of steps already taken.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Resumes from a previously reached step.
    pub fn with_global_step(mut self, global_step: usize) -> Self {
        self.global_step = global_step;
        self
    }
}
