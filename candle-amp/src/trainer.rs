//! Training loop implementation.

use crate::criterion::{Criterion, Reduction};
use crate::data::BatchLoader;
use crate::metrics::{Accuracy, Metric};
use crate::precision::{Autocast, Precision};
use crate::regularization::l1_penalty;
use crate::scaler::GradScaler;
use crate::scheduler::LrScheduler;
use crate::{Callback, EpochMetrics, ForwardCtx, LightModule, StepOutput, TrainerConfig};
use candle::{DType, Result};
use candle_nn::Optimizer;

/// Aggregated statistics for one pass over a loader.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochStats {
    /// Training: mean of the per-batch losses. Evaluation: summed loss
    /// divided by the dataset length.
    pub loss: f32,
    /// Percentage of correct predictions over the dataset length.
    pub accuracy: f32,
    pub batches: usize,
    pub samples: usize,
    /// Optimizer steps skipped because of non-finite gradients.
    pub skipped_steps: usize,
}

pub struct Trainer {
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    scheduler: Option<Box<dyn LrScheduler>>,
    scaler: GradScaler,
    epoch: usize,
    global_step: usize,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Result<Self> {
        // The cpu backend has no bf16 matmul or conv kernels.
        if config.precision == Precision::Bf16 && config.device.is_cpu() {
            candle::bail!("bf16 precision is not supported on the cpu device, use f16 or f32")
        }
        let scaler = GradScaler::new(config.effective_grad_scaler())?;
        Ok(Self {
            config,
            callbacks: Vec::new(),
            scheduler: None,
            scaler,
            epoch: 0,
            global_step: 0,
        })
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Attaches a learning-rate schedule, stepped after every batch.
    pub fn with_scheduler(mut self, scheduler: impl LrScheduler + 'static) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    pub fn scaler_mut(&mut self) -> &mut GradScaler {
        &mut self.scaler
    }

    /// Number of completed training epochs.
    pub fn current_epoch(&self) -> usize {
        self.epoch
    }

    /// Number of training batches processed so far.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    fn autocast(&self) -> Autocast {
        Autocast::new(self.config.precision)
    }

    fn run_callbacks<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn Callback, &Trainer) -> Result<()>,
    {
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let trainer: &Trainer = self;
        let result = callbacks.iter_mut().try_for_each(|cb| f(cb.as_mut(), trainer));
        self.callbacks = callbacks;
        result
    }

    /// Runs one epoch of mixed-precision training.
    ///
    /// Each batch is moved to the configured device and run forward under
    /// autocast. The loss (plus the optional L1 penalty) is scaled before the
    /// backward pass, and the optimizer only steps when the unscaled gradients
    /// are finite. The scheduler, if any, steps after every batch.
    pub fn train_epoch<M, O, C, L>(
        &mut self,
        model: &mut M,
        loader: &mut L,
        optimizer: &mut O,
        criterion: &C,
    ) -> Result<EpochStats>
    where
        M: LightModule,
        O: Optimizer,
        C: Criterion + ?Sized,
        L: BatchLoader + ?Sized,
    {
        let dataset_len = loader.dataset_len()?;
        let batches = loader.epoch_batches()?;
        if batches.is_empty() || dataset_len == 0 {
            candle::bail!("training loader yielded no samples")
        }

        let params = model.parameters();
        let autocast = self.autocast();
        let ctx = ForwardCtx::train(self.config.dropout, autocast);
        if let Some(scheduler) = self.scheduler.as_ref() {
            optimizer.set_learning_rate(scheduler.get_lr());
        }

        let num_batches = batches.len();
        let mut loss_sum = 0f64;
        let mut accuracy = Accuracy::new();
        let mut skipped_steps = 0;
        for (batch_idx, batch) in batches.into_iter().enumerate() {
            let batch = batch.to_device(&self.config.device)?;
            let output = autocast.to_full(&model.forward_t(&batch.data, &ctx)?)?;
            let mut loss = criterion.loss(&output, &batch.target, Reduction::Mean)?;
            if let Some(lambda) = self.config.l1_lambda {
                loss = (loss.to_dtype(DType::F32)? + l1_penalty(&params, lambda)?)?;
            }

            let loss_scale = self.scaler.scale_value();
            let mut grads = self.scaler.scale(&loss)?.backward()?;
            let stepped = self.scaler.step(optimizer, &mut grads, &params)?;
            self.scaler.update();
            if !stepped {
                skipped_steps += 1;
                tracing::debug!(
                    epoch = self.epoch,
                    batch_idx,
                    loss_scale,
                    "non-finite gradients, optimizer step skipped"
                );
            }
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.step();
                optimizer.set_learning_rate(scheduler.get_lr());
            }

            let loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            let correct_before = accuracy.correct();
            accuracy.update(&output, &batch.target)?;
            loss_sum += loss as f64;
            self.global_step += 1;

            let every = self.config.log_every_n_steps;
            if every > 0 && self.global_step % every == 0 {
                tracing::info!(
                    epoch = self.epoch,
                    step = self.global_step,
                    loss,
                    lr = optimizer.learning_rate(),
                    loss_scale,
                    "train"
                );
            }

            let output = StepOutput {
                loss,
                correct: accuracy.correct() - correct_before,
                batch_size: batch.len()?,
                stepped,
                loss_scale,
            };
            self.run_callbacks(|cb, trainer| cb.on_train_batch_end(trainer, batch_idx, &output))?;
        }
        self.epoch += 1;

        Ok(EpochStats {
            loss: (loss_sum / num_batches as f64) as f32,
            accuracy: accuracy.percent_of(dataset_len) as f32,
            batches: num_batches,
            samples: accuracy.seen(),
            skipped_steps,
        })
    }

    /// Evaluates the model without recording gradients.
    ///
    /// Losses are summed over every sample and divided by the dataset length.
    pub fn evaluate<M, C, L>(&self, model: &M, loader: &mut L, criterion: &C) -> Result<EpochStats>
    where
        M: LightModule,
        C: Criterion + ?Sized,
        L: BatchLoader + ?Sized,
    {
        let dataset_len = loader.dataset_len()?;
        let batches = loader.epoch_batches()?;
        if batches.is_empty() || dataset_len == 0 {
            candle::bail!("evaluation loader yielded no samples")
        }

        let autocast = self.autocast();
        let ctx = ForwardCtx::eval(autocast);
        let num_batches = batches.len();
        let mut loss_sum = 0f64;
        let mut accuracy = Accuracy::new();
        for batch in batches {
            let batch = batch.to_device(&self.config.device)?;
            let output = model.forward_t(&batch.data, &ctx)?.detach();
            let output = autocast.to_full(&output)?;
            let loss = criterion.loss(&output, &batch.target, Reduction::Sum)?;
            loss_sum += loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
            accuracy.update(&output, &batch.target)?;
        }

        Ok(EpochStats {
            loss: (loss_sum / dataset_len as f64) as f32,
            accuracy: accuracy.percent_of(dataset_len) as f32,
            batches: num_batches,
            samples: accuracy.seen(),
            skipped_steps: 0,
        })
    }

    /// Trains for `max_epochs` epochs, evaluating on `val_data` after each
    /// one, and returns the per-epoch metrics. Stops early when a callback
    /// asks to.
    pub fn fit<M, O, C, L>(
        &mut self,
        model: &mut M,
        optimizer: &mut O,
        criterion: &C,
        mut train_data: L,
        mut val_data: Option<L>,
    ) -> Result<Vec<EpochMetrics>>
    where
        M: LightModule,
        O: Optimizer,
        C: Criterion + ?Sized,
        L: BatchLoader,
    {
        let mut history = Vec::with_capacity(self.config.max_epochs);
        self.run_callbacks(|cb, trainer| cb.on_fit_start(trainer))?;

        for _ in 0..self.config.max_epochs {
            let epoch = self.epoch;
            self.run_callbacks(|cb, trainer| cb.on_epoch_start(trainer, epoch))?;

            let train = self.train_epoch(model, &mut train_data, optimizer, criterion)?;
            let val = match val_data.as_mut() {
                Some(val_data) => Some(self.evaluate(model, val_data, criterion)?),
                None => None,
            };

            let metrics = EpochMetrics {
                epoch,
                train_loss: train.loss,
                train_accuracy: train.accuracy,
                val_loss: val.as_ref().map(|v| v.loss),
                val_accuracy: val.as_ref().map(|v| v.accuracy),
                lr: optimizer.learning_rate(),
                loss_scale: self.scaler.scale_value(),
                skipped_steps: train.skipped_steps,
            };
            tracing::info!(
                epoch,
                train_loss = metrics.train_loss,
                train_accuracy = metrics.train_accuracy,
                val_loss = ?metrics.val_loss,
                val_accuracy = ?metrics.val_accuracy,
                lr = metrics.lr,
                loss_scale = metrics.loss_scale,
                skipped_steps = metrics.skipped_steps,
                "epoch"
            );

            self.run_callbacks(|cb, trainer| cb.on_epoch_end(trainer, epoch, &metrics))?;
            history.push(metrics);

            if self.callbacks.iter().any(|cb| cb.should_stop()) {
                break;
            }
        }

        self.run_callbacks(|cb, trainer| cb.on_fit_end(trainer))?;
        Ok(history)
    }
}
