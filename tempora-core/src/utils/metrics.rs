use crate::error::{Result, TemporaError};
use crate::workspace::StreamKey;
use candle_core::{DType, Tensor};

/// Mean of `values` over the entries where `mask` is non zero, `None` when the mask is empty.
pub fn masked_mean(values: &Tensor, mask: &Tensor) -> Result<Option<f64>> {
    if values.dims() != mask.dims() {
        return Err(TemporaError::shape(format!(
            "values {:?} and mask {:?} must share one shape",
            values.dims(),
            mask.dims()
        )));
    }
    let mask = mask.ne(0u8)?.to_dtype(DType::F32)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0. {
        return Ok(None);
    }
    let total = values
        .to_dtype(DType::F32)?
        .mul(&mask)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(Some((total / count) as f64))
}

/// Errors with `NumericalInstability` on `key` if `xs` holds a NaN or an infinity.
pub fn ensure_finite(xs: &Tensor, key: StreamKey) -> Result<()> {
    // x - x is zero for finite x and NaN otherwise
    let xs = xs.to_dtype(DType::F32)?;
    let diff = (&xs - &xs)?;
    let non_finite = diff
        .ne(&diff)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    if non_finite > 0. {
        return Err(TemporaError::NumericalInstability { key });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn only_masked_entries_count() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let values = Tensor::new(&[[10f32, 1.], [3., 7.]], &device)?;
        let mask = Tensor::new(&[[1u8, 0], [0, 1]], &device)?;
        assert_eq!(masked_mean(&values, &mask)?, Some(8.5));
        let empty = Tensor::zeros((2, 2), DType::U8, &device)?;
        assert_eq!(masked_mean(&values, &empty)?, None);
        Ok(())
    }

    #[test]
    fn nan_and_infinities_are_not_finite() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let finite = Tensor::new(&[1f32, -2., 0.], &device)?;
        assert!(ensure_finite(&finite, StreamKey::Reward).is_ok());
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let xs = Tensor::new(&[1f32, bad, 0.], &device)?;
            assert!(matches!(
                ensure_finite(&xs, StreamKey::Reward),
                Err(TemporaError::NumericalInstability {
                    key: StreamKey::Reward
                })
            ));
        }
        Ok(())
    }
}
