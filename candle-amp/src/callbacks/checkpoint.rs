//! Model checkpointing callback.

use super::{Callback, EpochMetrics, Mode};
use crate::Trainer;
use candle::Result;
use candle_nn::VarMap;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

struct CheckpointEntry {
    metric: f32,
    path: PathBuf,
    mode: Mode,
}

impl PartialEq for CheckpointEntry {
    fn eq(&self, other: &Self) -> bool {
        self.metric == other.metric
    }
}

impl Eq for CheckpointEntry {}

impl PartialOrd for CheckpointEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CheckpointEntry {
    // The heap top is the worst checkpoint, so it is the first to be pruned.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let ordering = self.metric.total_cmp(&other.metric);
        match self.mode {
            Mode::Min => ordering,
            Mode::Max => ordering.reverse(),
        }
    }
}

/// Path of the loss-scaler state written next to a weights file.
pub fn scaler_state_path(weights: &Path) -> PathBuf {
    weights.with_extension("scaler.json")
}

/// Saves the model's [`VarMap`] as safetensors whenever the monitored metric
/// improves, keeping the best `save_top_k` files on disk. The trainer's
/// [`GradScalerState`](crate::GradScalerState) is written alongside each
/// file, see [`scaler_state_path`].
pub struct ModelCheckpoint {
    varmap: VarMap,
    dirpath: PathBuf,
    monitor: String,
    save_top_k: usize,
    mode: Option<Mode>,
    checkpoints: BinaryHeap<CheckpointEntry>,
    best_metric: Option<f32>,
}

impl ModelCheckpoint {
    pub fn new(varmap: VarMap, dirpath: impl Into<PathBuf>) -> Self {
        Self {
            varmap,
            dirpath: dirpath.into(),
            monitor: "val_loss".to_string(),
            save_top_k: 1,
            mode: None,
            checkpoints: BinaryHeap::new(),
            best_metric: None,
        }
    }

    /// Sets the monitored metric. Unless [`ModelCheckpoint::mode`] is also
    /// called, accuracies are maximized and everything else minimized.
    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn save_top_k(mut self, k: usize) -> Self {
        self.save_top_k = k;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Path of the best checkpoint written so far.
    pub fn best_path(&self) -> Option<&Path> {
        self.checkpoints
            .iter()
            .min_by(|a, b| a.cmp(b))
            .map(|entry| entry.path.as_path())
    }

    fn resolved_mode(&self) -> Mode {
        self.mode.unwrap_or_else(|| Mode::for_metric(&self.monitor))
    }

    fn is_better(&self, current: f32, best: f32) -> bool {
        match self.resolved_mode() {
            Mode::Min => current < best,
            Mode::Max => current > best,
        }
    }

    fn save_checkpoint(&mut self, trainer: &Trainer, epoch: usize, metric: f32) -> Result<()> {
        std::fs::create_dir_all(&self.dirpath).map_err(candle::Error::wrap)?;

        let filename = format!("epoch_{:04}_{}_{:.4}.safetensors", epoch, self.monitor, metric);
        let path = self.dirpath.join(&filename);
        self.varmap.save(&path)?;
        let state = serde_json::to_vec_pretty(&trainer.scaler().state()).map_err(candle::Error::wrap)?;
        std::fs::write(scaler_state_path(&path), state).map_err(candle::Error::wrap)?;
        tracing::debug!(path = %path.display(), metric, "saved checkpoint");

        self.checkpoints.push(CheckpointEntry {
            metric,
            path,
            mode: self.resolved_mode(),
        });

        while self.checkpoints.len() > self.save_top_k {
            if let Some(entry) = self.checkpoints.pop() {
                for path in [scaler_state_path(&entry.path), entry.path] {
                    if let Err(err) = std::fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), %err, "failed to prune checkpoint");
                    }
                }
            }
        }

        Ok(())
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(
        &mut self,
        trainer: &Trainer,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        let Some(current) = metrics.get(&self.monitor) else {
            return Ok(());
        };

        let should_save = match self.best_metric {
            None => true,
            Some(best) => self.is_better(current, best),
        };

        if should_save {
            self.best_metric = Some(current);
            self.save_checkpoint(trainer, epoch, current)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GradScalerState, TrainerConfig};
    use candle::{DType, Device};
    use candle_nn::Init;

    fn metrics(epoch: usize, train_loss: f32, val_accuracy: f32) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss,
            train_accuracy: 50.0,
            val_loss: None,
            val_accuracy: Some(val_accuracy),
            lr: 0.1,
            loss_scale: 1.0,
            skipped_steps: 0,
        }
    }

    fn varmap() -> Result<VarMap> {
        let varmap = VarMap::new();
        varmap.get(2, "w", Init::Const(1.0), DType::F32, &Device::Cpu)?;
        Ok(varmap)
    }

    fn saved_epochs(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".safetensors"))
            .map(|name| name[..10].to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn prunes_the_worst_and_keeps_the_best() -> Result<()> {
        let dir = tempfile::tempdir().map_err(candle::Error::wrap)?;
        let trainer = Trainer::new(TrainerConfig::new())?;
        let mut checkpoint = ModelCheckpoint::new(varmap()?, dir.path())
            .monitor("train_loss")
            .save_top_k(2);

        for (epoch, loss) in [0.9, 0.5, 0.3].into_iter().enumerate() {
            checkpoint.on_epoch_end(&trainer, epoch, &metrics(epoch, loss, 0.0))?;
        }

        assert_eq!(saved_epochs(dir.path()), ["epoch_0001", "epoch_0002"]);
        let best = checkpoint.best_path().expect("no checkpoint").to_path_buf();
        assert!(best.file_name().unwrap().to_string_lossy().starts_with("epoch_0002"));
        Ok(())
    }

    #[test]
    fn accuracy_checkpoints_keep_the_highest() -> Result<()> {
        let dir = tempfile::tempdir().map_err(candle::Error::wrap)?;
        let trainer = Trainer::new(TrainerConfig::new())?;
        let mut checkpoint = ModelCheckpoint::new(varmap()?, dir.path())
            .monitor("val_accuracy")
            .save_top_k(1);

        for (epoch, acc) in [50.0, 40.0, 70.0, 90.0].into_iter().enumerate() {
            checkpoint.on_epoch_end(&trainer, epoch, &metrics(epoch, 1.0, acc))?;
        }

        assert_eq!(saved_epochs(dir.path()), ["epoch_0003"]);
        Ok(())
    }

    #[test]
    fn scaler_state_follows_the_weights() -> Result<()> {
        let dir = tempfile::tempdir().map_err(candle::Error::wrap)?;
        let trainer = Trainer::new(TrainerConfig::new().precision(crate::Precision::F16))?;
        let mut checkpoint = ModelCheckpoint::new(varmap()?, dir.path())
            .monitor("train_loss")
            .save_top_k(1);

        checkpoint.on_epoch_end(&trainer, 0, &metrics(0, 0.9, 0.0))?;
        let first = checkpoint.best_path().expect("no checkpoint").to_path_buf();
        checkpoint.on_epoch_end(&trainer, 1, &metrics(1, 0.5, 0.0))?;
        let second = checkpoint.best_path().expect("no checkpoint").to_path_buf();

        assert!(!scaler_state_path(&first).exists());
        let json = std::fs::read_to_string(scaler_state_path(&second)).map_err(candle::Error::wrap)?;
        let state: GradScalerState = serde_json::from_str(&json).map_err(candle::Error::wrap)?;
        assert_eq!(state, trainer.scaler().state());
        assert_eq!(state.scale, 65536.0);
        Ok(())
    }
}
