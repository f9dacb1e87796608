//! Mixed-precision training and evaluation loops for Candle.
//!
//! [`Trainer::train_epoch`] runs the forward pass under [`Autocast`], scales
//! the loss through a [`GradScaler`] before the backward pass and steps the
//! optimizer and an optional [`LrScheduler`]. [`Trainer::evaluate`] runs the
//! same forward pass without gradients and reports loss and accuracy.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

pub mod callbacks;
pub mod config;
pub mod criterion;
pub mod data;
pub mod metrics;
pub mod module;
pub mod precision;
pub mod regularization;
pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use callbacks::{scaler_state_path, Callback, EarlyStopping, EpochMetrics, ModelCheckpoint, Mode};
pub use config::{TrainerConfig, TrainerSettings};
pub use criterion::{Criterion, CrossEntropy, Nll, Reduction};
pub use data::{Batch, BatchLoader, DataLoader};
pub use metrics::{Accuracy, Metric};
pub use module::{ForwardCtx, LightModule, StepOutput};
pub use precision::{Autocast, Precision};
pub use scaler::{GradScaler, GradScalerConfig, GradScalerState};
pub use scheduler::{LrScheduler, OneCycleLr, StepLr};
pub use trainer::{EpochStats, Trainer};

pub use candle::{Module, ModuleT};
