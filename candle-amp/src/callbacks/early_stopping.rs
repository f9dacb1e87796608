//! Early stopping callback.

use super::{Callback, EpochMetrics, Mode};
use crate::Trainer;
use candle::Result;

/// Stops training once the monitored metric has not improved for
/// `patience` consecutive epochs.
pub struct EarlyStopping {
    monitor: String,
    patience: usize,
    min_delta: f32,
    // Derived from the monitored metric's name unless set explicitly.
    mode: Option<Mode>,
    best_metric: Option<f32>,
    epochs_without_improvement: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new() -> Self {
        Self {
            monitor: "val_loss".to_string(),
            patience: 3,
            min_delta: 0.0,
            mode: None,
            best_metric: None,
            epochs_without_improvement: 0,
            stopped_epoch: None,
        }
    }

    /// Sets the monitored metric. Unless [`EarlyStopping::mode`] is also
    /// called, accuracies are maximized and everything else minimized.
    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_delta(mut self, delta: f32) -> Self {
        self.min_delta = delta;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    fn resolved_mode(&self) -> Mode {
        self.mode.unwrap_or_else(|| Mode::for_metric(&self.monitor))
    }

    pub fn best_metric(&self) -> Option<f32> {
        self.best_metric
    }

    /// Epoch at which training was stopped, if it was.
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    fn is_improvement(&self, current: f32, best: f32) -> bool {
        match self.resolved_mode() {
            Mode::Min => current < best - self.min_delta,
            Mode::Max => current > best + self.min_delta,
        }
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for EarlyStopping {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        let Some(current) = metrics.get(&self.monitor) else {
            return Ok(());
        };

        let improved = match self.best_metric {
            None => true,
            Some(best) => self.is_improvement(current, best),
        };
        if improved {
            self.best_metric = Some(current);
            self.epochs_without_improvement = 0;
            return Ok(());
        }

        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            tracing::info!(
                epoch,
                monitor = %self.monitor,
                best = ?self.best_metric,
                "early stopping"
            );
            self.stopped_epoch = Some(epoch);
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stopped_epoch.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrainerConfig;

    fn metrics(epoch: usize, val_accuracy: f32) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: 1.0,
            train_accuracy: 50.0,
            val_loss: Some(1.0),
            val_accuracy: Some(val_accuracy),
            lr: 0.1,
            loss_scale: 1.0,
            skipped_steps: 0,
        }
    }

    fn feed(stopper: &mut EarlyStopping, values: &[f32]) -> Result<()> {
        let trainer = Trainer::new(TrainerConfig::new())?;
        for (epoch, value) in values.iter().enumerate() {
            stopper.on_epoch_end(&trainer, epoch, &metrics(epoch, *value))?;
        }
        Ok(())
    }

    #[test]
    fn accuracy_is_maximized_by_default() -> Result<()> {
        let mut stopper = EarlyStopping::new().monitor("val_accuracy").patience(1);
        feed(&mut stopper, &[50.0, 60.0, 70.0])?;
        assert!(!stopper.should_stop());
        assert_eq!(stopper.best_metric(), Some(70.0));

        feed(&mut stopper, &[65.0])?;
        assert!(stopper.should_stop());
        Ok(())
    }

    #[test]
    fn explicit_mode_survives_monitor() -> Result<()> {
        let mut stopper = EarlyStopping::new()
            .mode(Mode::Min)
            .monitor("val_accuracy")
            .patience(1);
        feed(&mut stopper, &[50.0, 60.0])?;
        assert!(stopper.should_stop());
        assert_eq!(stopper.best_metric(), Some(50.0));
        assert_eq!(stopper.stopped_epoch(), Some(1));
        Ok(())
    }
}
