//! LightModule trait for trainable classifiers.

use crate::precision::Autocast;
use candle::{Result, Tensor, Var};

/// Per-pass settings handed to [`LightModule::forward_t`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ForwardCtx {
    /// Training mode, as opposed to evaluation.
    pub train: bool,
    /// Whether dropout layers are active. Always `false` in evaluation.
    pub dropout: bool,
    pub autocast: Autocast,
}

impl ForwardCtx {
    pub fn train(dropout: bool, autocast: Autocast) -> Self {
        Self {
            train: true,
            dropout,
            autocast,
        }
    }

    pub fn eval(autocast: Autocast) -> Self {
        Self {
            train: false,
            dropout: false,
            autocast,
        }
    }

    /// `train && dropout`, the flag to pass to `ModuleT::forward_t`.
    pub fn dropout_active(&self) -> bool {
        self.train && self.dropout
    }
}

/// Output of a single training step, reported to callbacks.
#[derive(Clone, Debug)]
pub struct StepOutput {
    /// Loss of the step, including any regularization penalty.
    pub loss: f32,
    pub correct: usize,
    pub batch_size: usize,
    /// `false` when the loss scaler skipped the optimizer step on overflow.
    pub stepped: bool,
    /// Loss scale used for the step.
    pub loss_scale: f64,
}

/// Trait for models that can be trained with [`Trainer`](crate::Trainer).
pub trait LightModule {
    /// Computes logits (or log-probabilities) for a batch of inputs.
    ///
    /// Implementations route weights and inputs through `ctx.autocast` to run
    /// in the configured precision.
    fn forward_t(&self, xs: &Tensor, ctx: &ForwardCtx) -> Result<Tensor>;

    /// Return all trainable parameters.
    ///
    /// The trainer unscales and checks the gradients of exactly these vars
    /// before stepping, so the list must cover every var the optimizer owns.
    /// An optimizer var missing here is stepped with a gradient still
    /// multiplied by the loss scale.
    fn parameters(&self) -> Vec<Var>;
}
