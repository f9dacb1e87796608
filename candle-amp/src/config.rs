//! Trainer configuration.

use crate::precision::Precision;
use crate::scaler::GradScalerConfig;
use candle::{Device, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub struct TrainerConfig {
    pub max_epochs: usize,
    pub device: Device,
    pub log_every_n_steps: usize,
    pub precision: Precision,
    /// Enables dropout during training steps.
    pub dropout: bool,
    /// Weight of the L1 penalty added to the training loss.
    pub l1_lambda: Option<f64>,
    /// Loss scaling settings. `None` enables scaling only for `f16`.
    pub grad_scaler: Option<GradScalerConfig>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1000,
            device: Device::Cpu,
            log_every_n_steps: 50,
            precision: Precision::F32,
            dropout: false,
            l1_lambda: None,
            grad_scaler: None,
        }
    }
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_epochs(mut self, epochs: usize) -> Self {
        self.max_epochs = epochs;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn log_every_n_steps(mut self, n: usize) -> Self {
        self.log_every_n_steps = n;
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn dropout(mut self, enabled: bool) -> Self {
        self.dropout = enabled;
        self
    }

    pub fn l1(mut self, lambda: f64) -> Self {
        self.l1_lambda = Some(lambda);
        self
    }

    pub fn grad_scaler(mut self, config: GradScalerConfig) -> Self {
        self.grad_scaler = Some(config);
        self
    }

    /// Scaler settings after applying the precision-based default.
    pub fn effective_grad_scaler(&self) -> GradScalerConfig {
        match &self.grad_scaler {
            Some(config) => config.clone(),
            None if self.precision.needs_loss_scaling() => GradScalerConfig::default(),
            None => GradScalerConfig::disabled(),
        }
    }

    pub fn from_settings(settings: TrainerSettings, device: Device) -> Self {
        Self {
            max_epochs: settings.max_epochs,
            device,
            log_every_n_steps: settings.log_every_n_steps,
            precision: settings.precision,
            dropout: settings.dropout,
            l1_lambda: settings.l1_lambda,
            grad_scaler: settings.grad_scaler,
        }
    }
}

/// Serializable trainer settings, everything but the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub max_epochs: usize,
    pub log_every_n_steps: usize,
    pub precision: Precision,
    pub dropout: bool,
    pub l1_lambda: Option<f64>,
    pub grad_scaler: Option<GradScalerConfig>,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        let config = TrainerConfig::default();
        Self {
            max_epochs: config.max_epochs,
            log_every_n_steps: config.log_every_n_steps,
            precision: config.precision,
            dropout: config.dropout,
            l1_lambda: config.l1_lambda,
            grad_scaler: config.grad_scaler,
        }
    }
}

impl TrainerSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(candle::Error::wrap)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| candle::Error::wrap(e).context(format!("opening {}", path.display())))?;
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(candle::Error::wrap)
    }
}
