//! Weight penalties added to the training loss.

use candle::{DType, Result, Tensor, Var};

/// `lambda * sum(|w|)` over every parameter, computed in `f32`.
pub fn l1_penalty(vars: &[Var], lambda: f64) -> Result<Tensor> {
    let Some(first) = vars.first() else {
        candle::bail!("l1 penalty needs at least one parameter")
    };
    let mut total = Tensor::zeros((), DType::F32, first.device())?;
    for var in vars {
        let abs_sum = var.to_dtype(DType::F32)?.abs()?.sum_all()?;
        total = (total + abs_sum)?;
    }
    total.affine(lambda, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn penalty_and_gradient() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[1f32, -2., 3.], &dev)?;
        let b = Var::new(&[-0.5f32], &dev)?;
        let penalty = l1_penalty(&[w.clone(), b.clone()], 0.1)?;
        assert!((penalty.to_scalar::<f32>()? - 0.65).abs() < 1e-6);

        let grads = penalty.backward()?;
        let gw = grads.get(&w).unwrap().to_vec1::<f32>()?;
        for (g, expected) in gw.iter().zip([0.1f32, -0.1, 0.1]) {
            assert!((g - expected).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn empty_parameter_list_is_an_error() {
        assert!(l1_penalty(&[], 1e-4).is_err());
    }
}
