//! Dynamic loss scaling for reduced-precision training.
//!
//! The loss is multiplied by a large factor before the backward pass so that
//! small `f16` gradients do not underflow. Gradients are divided by the same
//! factor before the optimizer sees them. When a scaled gradient overflows the
//! step is skipped and the factor backs off; after a run of clean steps it
//! grows again.

use candle::backprop::GradStore;
use candle::{DType, Result, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradScalerConfig {
    pub enabled: bool,
    pub init_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    /// Number of consecutive finite steps before the scale is grown.
    pub growth_interval: usize,
}

impl Default for GradScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

impl GradScalerConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn init_scale(mut self, scale: f64) -> Self {
        self.init_scale = scale;
        self
    }

    pub fn growth_interval(mut self, interval: usize) -> Self {
        self.growth_interval = interval;
        self
    }
}

/// Serializable scaler state. [`ModelCheckpoint`](crate::ModelCheckpoint)
/// writes it next to every weights file it keeps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
    pub scale: f64,
    pub growth_tracker: usize,
}

#[derive(Debug)]
pub struct GradScaler {
    config: GradScalerConfig,
    scale: f64,
    growth_tracker: usize,
    // Set by `unscale`, consumed by `update`.
    found_inf: Option<bool>,
}

impl GradScaler {
    pub fn new(config: GradScalerConfig) -> Result<Self> {
        if config.init_scale <= 0.0 || !config.init_scale.is_finite() {
            candle::bail!("grad scaler init_scale must be positive, got {}", config.init_scale)
        }
        if config.growth_factor <= 1.0 {
            candle::bail!("grad scaler growth_factor must be > 1, got {}", config.growth_factor)
        }
        if config.backoff_factor <= 0.0 || config.backoff_factor >= 1.0 {
            candle::bail!(
                "grad scaler backoff_factor must be in (0, 1), got {}",
                config.backoff_factor
            )
        }
        if config.growth_interval == 0 {
            candle::bail!("grad scaler growth_interval must be non-zero")
        }
        Ok(Self {
            scale: config.init_scale,
            config,
            growth_tracker: 0,
            found_inf: None,
        })
    }

    pub fn disabled() -> Self {
        let config = GradScalerConfig::disabled();
        Self {
            scale: 1.0,
            config,
            growth_tracker: 0,
            found_inf: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &GradScalerConfig {
        &self.config
    }

    /// Current loss scale, `1.0` when disabled.
    pub fn scale_value(&self) -> f64 {
        if self.config.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Multiplies the loss by the current scale.
    pub fn scale(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.config.enabled {
            return Ok(loss.clone());
        }
        loss.affine(self.scale, 0.0)
    }

    /// Divides the gradients of `vars` by the scale in place and reports
    /// whether any of them holds an inf or NaN. Calling it again before
    /// [`GradScaler::update`] returns the cached result without touching the
    /// gradients.
    pub fn unscale(&mut self, grads: &mut GradStore, vars: &[Var]) -> Result<bool> {
        if let Some(found_inf) = self.found_inf {
            return Ok(found_inf);
        }
        let inv_scale = 1.0 / self.scale_value();
        let mut found_inf = false;
        for var in vars {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            let grad = if self.config.enabled {
                grad.affine(inv_scale, 0.0)?
            } else {
                grad.clone()
            };
            if !found_inf && !all_finite(&grad)? {
                found_inf = true;
            }
            grads.insert(var, grad);
        }
        self.found_inf = Some(found_inf);
        Ok(found_inf)
    }

    /// Unscales the gradients if that has not happened yet and steps the
    /// optimizer unless an overflow was found. Returns whether the optimizer
    /// was stepped.
    pub fn step<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        grads: &mut GradStore,
        vars: &[Var],
    ) -> Result<bool> {
        if !self.config.enabled {
            optimizer.step(grads)?;
            return Ok(true);
        }
        if self.unscale(grads, vars)? {
            return Ok(false);
        }
        optimizer.step(grads)?;
        Ok(true)
    }

    /// Adjusts the scale for the next iteration.
    pub fn update(&mut self) {
        let found_inf = self.found_inf.take();
        if !self.config.enabled {
            return;
        }
        match found_inf {
            Some(true) => {
                self.scale *= self.config.backoff_factor;
                self.growth_tracker = 0;
                tracing::debug!(scale = self.scale, "loss scale backed off");
            }
            Some(false) => {
                self.growth_tracker += 1;
                if self.growth_tracker == self.config.growth_interval {
                    self.scale *= self.config.growth_factor;
                    self.growth_tracker = 0;
                    tracing::debug!(scale = self.scale, "loss scale grown");
                }
            }
            None => {}
        }
    }

    pub fn state(&self) -> GradScalerState {
        GradScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    pub fn load_state(&mut self, state: GradScalerState) -> Result<()> {
        if state.scale <= 0.0 || !state.scale.is_finite() {
            candle::bail!("invalid grad scaler state, scale {}", state.scale)
        }
        self.scale = state.scale;
        self.growth_tracker = state.growth_tracker;
        self.found_inf = None;
        Ok(())
    }
}

// `t - t` is zero for finite elements and NaN for inf or NaN ones, so the sum
// cannot overflow on large finite gradients.
fn all_finite(t: &Tensor) -> Result<bool> {
    let t = t.to_dtype(DType::F32)?;
    let total = t.sub(&t)?.sum_all()?.to_scalar::<f32>()?;
    Ok(total.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::SGD;

    #[test]
    fn rejects_invalid_config() {
        assert!(GradScaler::new(GradScalerConfig::default().init_scale(0.0)).is_err());
        assert!(GradScaler::new(GradScalerConfig::default().growth_interval(0)).is_err());
        let config = GradScalerConfig {
            backoff_factor: 1.5,
            ..Default::default()
        };
        assert!(GradScaler::new(config).is_err());
    }

    #[test]
    fn finite_step_unscales_before_update() -> Result<()> {
        let w = Var::new(&[1f32, 2.], &Device::Cpu)?;
        let mut sgd = SGD::new(vec![w.clone()], 0.1)?;
        let mut scaler = GradScaler::new(GradScalerConfig::default().init_scale(1024.0))?;

        let loss = w.sqr()?.sum_all()?;
        let mut grads = scaler.scale(&loss)?.backward()?;
        assert_eq!(grads.get(&w).unwrap().to_vec1::<f32>()?, [2048.0, 4096.0]);

        let stepped = scaler.step(&mut sgd, &mut grads, &[w.clone()])?;
        scaler.update();
        assert!(stepped);
        let w = w.to_vec1::<f32>()?;
        assert!((w[0] - 0.8).abs() < 1e-6);
        assert!((w[1] - 1.6).abs() < 1e-6);
        assert_eq!(scaler.scale_value(), 1024.0);
        Ok(())
    }

    #[test]
    fn overflow_skips_step_and_backs_off() -> Result<()> {
        let w = Var::new(&[1f32], &Device::Cpu)?;
        let mut sgd = SGD::new(vec![w.clone()], 0.1)?;
        let mut scaler = GradScaler::new(GradScalerConfig::default().init_scale(1e10))?;

        // d(loss)/dw = 1e30, times 1e10 overflows f32.
        let loss = w.affine(1e30, 0.0)?.sum_all()?;
        let mut grads = scaler.scale(&loss)?.backward()?;
        let stepped = scaler.step(&mut sgd, &mut grads, &[w.clone()])?;
        scaler.update();

        assert!(!stepped);
        assert_eq!(w.to_vec1::<f32>()?, [1.0]);
        assert_eq!(scaler.scale_value(), 5e9);
        assert_eq!(scaler.state().growth_tracker, 0);
        Ok(())
    }

    #[test]
    fn large_finite_gradients_still_step() -> Result<()> {
        let w = Var::new(&[1f32, 1.], &Device::Cpu)?;
        let mut sgd = SGD::new(vec![w.clone()], 0.0)?;
        let mut scaler = GradScaler::new(GradScalerConfig::default().init_scale(1.0))?;

        // Each gradient is 3e38, finite, but their f32 sum is not.
        let loss = w.affine(3e38, 0.0)?.sum_all()?;
        let mut grads = scaler.scale(&loss)?.backward()?;
        let stepped = scaler.step(&mut sgd, &mut grads, &[w.clone()])?;
        scaler.update();

        assert!(stepped);
        assert_eq!(scaler.scale_value(), 1.0);
        assert_eq!(scaler.state().growth_tracker, 1);
        Ok(())
    }

    #[test]
    fn nan_gradients_are_detected() -> Result<()> {
        let w = Var::new(&[1f32, 2.], &Device::Cpu)?;
        let mut grads = w.sum_all()?.backward()?;
        grads.insert(&w, Tensor::new(&[f32::NAN, 1.0], &Device::Cpu)?);

        let mut scaler = GradScaler::new(GradScalerConfig::default().init_scale(2.0))?;
        assert!(scaler.unscale(&mut grads, &[w.clone()])?);
        Ok(())
    }

    #[test]
    fn second_unscale_is_a_no_op() -> Result<()> {
        let w = Var::new(&[1f32], &Device::Cpu)?;
        let mut scaler = GradScaler::new(GradScalerConfig::default().init_scale(4.0))?;

        let loss = w.sum_all()?;
        let mut grads = scaler.scale(&loss)?.backward()?;
        assert!(!scaler.unscale(&mut grads, &[w.clone()])?);
        assert!(!scaler.unscale(&mut grads, &[w.clone()])?);
        assert_eq!(grads.get(&w).unwrap().to_vec1::<f32>()?, [1.0]);

        // The optimizer sees the once-unscaled gradient.
        let mut sgd = SGD::new(vec![w.clone()], 0.5)?;
        assert!(scaler.step(&mut sgd, &mut grads, &[w.clone()])?);
        scaler.update();
        assert_eq!(w.to_vec1::<f32>()?, [0.5]);
        Ok(())
    }

    #[test]
    fn scale_grows_after_interval() -> Result<()> {
        let w = Var::new(&[0.5f32], &Device::Cpu)?;
        let mut sgd = SGD::new(vec![w.clone()], 0.01)?;
        let config = GradScalerConfig::default().init_scale(8.0).growth_interval(2);
        let mut scaler = GradScaler::new(config)?;

        let mut scales = Vec::new();
        for _ in 0..4 {
            let loss = w.sqr()?.sum_all()?;
            let mut grads = scaler.scale(&loss)?.backward()?;
            scaler.step(&mut sgd, &mut grads, &[w.clone()])?;
            scaler.update();
            scales.push(scaler.scale_value());
        }
        assert_eq!(scales, [8.0, 16.0, 16.0, 32.0]);
        Ok(())
    }

    #[test]
    fn disabled_scaler_is_transparent() -> Result<()> {
        let w = Var::new(&[3f32], &Device::Cpu)?;
        let mut sgd = SGD::new(vec![w.clone()], 0.5)?;
        let mut scaler = GradScaler::disabled();

        let loss = w.sum_all()?;
        let scaled = scaler.scale(&loss)?;
        assert_eq!(scaled.to_scalar::<f32>()?, 3.0);
        let mut grads = scaled.backward()?;
        assert!(scaler.step(&mut sgd, &mut grads, &[w.clone()])?);
        scaler.update();
        assert_eq!(w.to_vec1::<f32>()?, [2.5]);
        assert_eq!(scaler.scale_value(), 1.0);
        Ok(())
    }

    #[test]
    fn state_round_trips_through_json() -> Result<()> {
        let mut scaler = GradScaler::new(GradScalerConfig::default())?;
        scaler.load_state(GradScalerState {
            scale: 512.0,
            growth_tracker: 7,
        })?;
        let json = serde_json::to_string(&scaler.state()).map_err(candle::Error::wrap)?;
        let state: GradScalerState = serde_json::from_str(&json).map_err(candle::Error::wrap)?;
        assert_eq!(state.scale, 512.0);
        assert_eq!(state.growth_tracker, 7);
        assert!(scaler.load_state(GradScalerState { scale: f64::NAN, growth_tracker: 0 }).is_err());
        Ok(())
    }
}
