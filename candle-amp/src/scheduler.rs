//! Learning-rate schedules.
//!
//! Schedulers only compute a learning rate. The trainer writes it into the
//! optimizer through [`candle_nn::Optimizer::set_learning_rate`] after every
//! batch.

use std::f64::consts::PI;

pub trait LrScheduler {
    /// Learning rate for the next optimizer step.
    fn get_lr(&self) -> f64;

    /// Advances the schedule by one step.
    fn step(&mut self);
}

/// One-cycle policy: cosine warmup from `max_lr / div_factor` to `max_lr`
/// over the first `pct_start` of the run, then cosine annealing down to
/// `initial_lr / final_div_factor`.
#[derive(Clone, Debug)]
pub struct OneCycleLr {
    max_lr: f64,
    total_steps: usize,
    pct_start: f64,
    div_factor: f64,
    final_div_factor: f64,
    current_step: usize,
}

impl OneCycleLr {
    pub fn new(max_lr: f64, total_steps: usize) -> Self {
        Self {
            max_lr,
            total_steps,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
            current_step: 0,
        }
    }

    /// Convenience for the common epochs x batches-per-epoch setup.
    pub fn with_epochs(max_lr: f64, epochs: usize, steps_per_epoch: usize) -> Self {
        Self::new(max_lr, epochs * steps_per_epoch)
    }

    pub fn pct_start(mut self, pct: f64) -> Self {
        self.pct_start = pct;
        self
    }

    pub fn div_factor(mut self, factor: f64) -> Self {
        self.div_factor = factor;
        self
    }

    pub fn final_div_factor(mut self, factor: f64) -> Self {
        self.final_div_factor = factor;
        self
    }

    pub fn initial_lr(&self) -> f64 {
        self.max_lr / self.div_factor
    }

    pub fn min_lr(&self) -> f64 {
        self.initial_lr() / self.final_div_factor
    }

    fn anneal_cos(start: f64, end: f64, pct: f64) -> f64 {
        end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
    }
}

impl LrScheduler for OneCycleLr {
    fn get_lr(&self) -> f64 {
        let last_step = self.total_steps.saturating_sub(1) as f64;
        let warmup_end = self.pct_start * self.total_steps as f64 - 1.0;
        let step = (self.current_step as f64).min(last_step);

        if step <= warmup_end {
            let pct = if warmup_end > 0.0 { step / warmup_end } else { 1.0 };
            Self::anneal_cos(self.initial_lr(), self.max_lr, pct)
        } else {
            let span = last_step - warmup_end;
            let pct = if span > 0.0 { (step - warmup_end) / span } else { 1.0 };
            Self::anneal_cos(self.max_lr, self.min_lr(), pct)
        }
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` steps.
#[derive(Clone, Debug)]
pub struct StepLr {
    initial_lr: f64,
    step_size: usize,
    gamma: f64,
    current_step: usize,
}

impl StepLr {
    pub fn new(initial_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            initial_lr,
            step_size,
            gamma,
            current_step: 0,
        }
    }
}

impl LrScheduler for StepLr {
    fn get_lr(&self) -> f64 {
        if self.step_size == 0 {
            return self.initial_lr;
        }
        let decays = self.current_step / self.step_size;
        self.initial_lr * self.gamma.powi(decays as i32)
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}
