//! Callback system for training hooks.

mod checkpoint;
mod early_stopping;

pub use checkpoint::{scaler_state_path, ModelCheckpoint};
pub use early_stopping::EarlyStopping;

use crate::{StepOutput, Trainer};
use candle::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Min,
    Max,
}

impl Mode {
    /// `Max` for accuracies, `Min` for everything else.
    pub fn for_metric(name: &str) -> Self {
        if name.ends_with("accuracy") {
            Mode::Max
        } else {
            Mode::Min
        }
    }
}

#[derive(Clone, Debug)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    /// Percentage of correctly classified training samples.
    pub train_accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    /// Learning rate at the end of the epoch.
    pub lr: f64,
    pub loss_scale: f64,
    pub skipped_steps: usize,
}

impl EpochMetrics {
    /// Looks up a monitored value by name.
    pub fn get(&self, name: &str) -> Option<f32> {
        match name {
            "train_loss" => Some(self.train_loss),
            "train_accuracy" => Some(self.train_accuracy),
            "val_loss" => self.val_loss,
            "val_accuracy" => self.val_accuracy,
            _ => None,
        }
    }
}

pub trait Callback: Send {
    fn on_fit_start(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> Result<()> {
        Ok(())
    }

    fn should_stop(&self) -> bool {
        false
    }
}
