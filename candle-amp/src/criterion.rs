//! Classification losses.

use candle::{Result, Tensor, D};

/// How per-sample losses are folded into the returned scalar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

/// A loss over `(batch, classes)` model outputs and rank-1 class targets.
pub trait Criterion {
    fn loss(&self, output: &Tensor, target: &Tensor, reduction: Reduction) -> Result<Tensor>;
}

impl<F> Criterion for F
where
    F: Fn(&Tensor, &Tensor, Reduction) -> Result<Tensor>,
{
    fn loss(&self, output: &Tensor, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        self(output, target, reduction)
    }
}

/// Negative log-likelihood over outputs that already are log-probabilities.
#[derive(Clone, Copy, Debug, Default)]
pub struct Nll;

impl Criterion for Nll {
    fn loss(&self, output: &Tensor, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        nll(output, target, reduction)
    }
}

/// Log-softmax over the last dimension followed by [`Nll`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CrossEntropy;

impl Criterion for CrossEntropy {
    fn loss(&self, output: &Tensor, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        let log_sm = candle_nn::ops::log_softmax(output, D::Minus1)?;
        nll(&log_sm, target, reduction)
    }
}

fn nll(log_probs: &Tensor, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
    let mean = candle_nn::loss::nll(log_probs, target)?;
    match reduction {
        Reduction::Mean => Ok(mean),
        Reduction::Sum => mean.affine(target.dims1()? as f64, 0.0),
    }
}
