//! Metrics for tracking training progress.

use candle::{DType, Result, Tensor, D};

pub trait Metric {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()>;
    fn compute(&self) -> f64;
    fn reset(&mut self);
}

/// Number of rows whose argmax over the last dimension equals the target.
pub fn correct_predictions(logits: &Tensor, targets: &Tensor) -> Result<usize> {
    let preds = logits.argmax(D::Minus1)?;
    let targets = targets.to_dtype(DType::U32)?;
    let correct = preds
        .eq(&targets)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(correct as usize)
}

/// Classification accuracy, reported as a percentage.
#[derive(Clone, Debug, Default)]
pub struct Accuracy {
    correct: usize,
    seen: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Percentage of correct predictions against an explicit sample count.
    pub fn percent_of(&self, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        100.0 * self.correct as f64 / total as f64
    }
}

impl Metric for Accuracy {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        self.correct += correct_predictions(preds, targets)?;
        self.seen += targets.dim(0)?;
        Ok(())
    }

    fn compute(&self) -> f64 {
        self.percent_of(self.seen)
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.seen = 0;
    }
}
