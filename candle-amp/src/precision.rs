//! Compute precision and the autocast context used during forward passes.

use candle::{DType, Module, Result, Tensor};
use candle_nn::{Conv2d, Linear};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Precision used for the forward pass.
///
/// Parameters are always kept in their storage dtype (usually `f32`); the
/// reduced formats only apply to the per-step copies made by [`Autocast`].
/// `Bf16` needs a cuda or metal device, the cpu backend cannot run bf16
/// matmuls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }

    /// Whether this precision narrows activations below `f32`.
    pub fn is_reduced(&self) -> bool {
        !matches!(self, Self::F32)
    }

    /// `f16` has a narrow exponent range and needs loss scaling to keep small
    /// gradients from flushing to zero. `bf16` shares the `f32` exponent.
    pub fn needs_loss_scaling(&self) -> bool {
        matches!(self, Self::F16)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::Bf16 => write!(f, "bf16"),
        }
    }
}

impl FromStr for Precision {
    type Err = candle::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "fp32" => Ok(Self::F32),
            "f16" | "fp16" | "half" => Ok(Self::F16),
            "bf16" => Ok(Self::Bf16),
            other => candle::bail!("unknown precision '{other}', expected f32, f16 or bf16"),
        }
    }
}

/// Autocast context for a single forward pass.
///
/// Floating-point tensors routed through [`Autocast::cast`] are converted to
/// the compute dtype. The conversion is part of the autograd graph, so the
/// gradient for an `f32` parameter comes back as `f32` even when the layer ran
/// in `f16`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Autocast {
    dtype: DType,
}

impl Autocast {
    pub fn new(precision: Precision) -> Self {
        Self {
            dtype: precision.dtype(),
        }
    }

    pub fn disabled() -> Self {
        Self { dtype: DType::F32 }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_enabled(&self) -> bool {
        self.dtype != DType::F32
    }

    /// Casts a floating-point tensor to the compute dtype. Integer tensors
    /// (labels, token ids) are returned as is.
    pub fn cast(&self, xs: &Tensor) -> Result<Tensor> {
        if !self.is_enabled() || !xs.dtype().is_float() || xs.dtype() == self.dtype {
            return Ok(xs.clone());
        }
        xs.to_dtype(self.dtype)
    }

    /// Casts a floating-point tensor back to `f32`, used before softmax and
    /// loss computations.
    pub fn to_full(&self, xs: &Tensor) -> Result<Tensor> {
        if !xs.dtype().is_float() || xs.dtype() == DType::F32 {
            return Ok(xs.clone());
        }
        xs.to_dtype(DType::F32)
    }

    /// Runs a linear layer in the compute dtype.
    pub fn linear(&self, layer: &Linear, xs: &Tensor) -> Result<Tensor> {
        if !self.is_enabled() {
            return layer.forward(xs);
        }
        let weight = self.cast(layer.weight())?;
        let bias = layer.bias().map(|b| self.cast(b)).transpose()?;
        Linear::new(weight, bias).forward(&self.cast(xs)?)
    }

    /// Runs a 2d convolution in the compute dtype.
    pub fn conv2d(&self, layer: &Conv2d, xs: &Tensor) -> Result<Tensor> {
        if !self.is_enabled() {
            return layer.forward(xs);
        }
        let weight = self.cast(layer.weight())?;
        let bias = layer.bias().map(|b| self.cast(b)).transpose()?;
        Conv2d::new(weight, bias, layer.config().clone()).forward(&self.cast(xs)?)
    }
}

impl Default for Autocast {
    fn default() -> Self {
        Self::disabled()
    }
}

impl From<Precision> for Autocast {
    fn from(precision: Precision) -> Self {
        Self::new(precision)
    }
}
