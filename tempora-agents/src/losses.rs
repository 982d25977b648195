use candle_core::{D, DType, Tensor};
use derive_more::{Deref, DerefMut, Display};
use tempora_core::{Result, TemporaError};

#[derive(Deref, DerefMut, Debug, Display)]
pub struct Advantages(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct PolicyLoss(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct ValueLoss(pub Tensor);

/// `-mean(min(ratio * adv, clamp(ratio, 1 - clip, 1 + clip) * adv))`
pub fn clipped_surrogate(
    ratio: &Tensor,
    advantages: &Advantages,
    clip_ratio: f32,
) -> Result<PolicyLoss> {
    if ratio.dims() != advantages.dims() {
        return Err(TemporaError::shape(format!(
            "ratio {:?} and advantages {:?} must share one shape",
            ratio.dims(),
            advantages.dims()
        )));
    }
    let clip_adv = ratio
        .clamp(1. - clip_ratio, 1. + clip_ratio)?
        .mul(advantages)?;
    let loss = Tensor::minimum(&ratio.mul(advantages)?, &clip_adv)?
        .mean_all()?
        .neg()?;
    Ok(PolicyLoss(loss))
}

/// Mean squared TD error.
pub fn squared_td(td: &Tensor) -> Result<ValueLoss> {
    Ok(ValueLoss(td.sqr()?.mean_all()?))
}

/// Picks `probs[t, b, action[t, b]]`, turning `[T, B, A]` probabilities into `[T, B]`.
pub fn index_3d(probs: &Tensor, action: &Tensor) -> Result<Tensor> {
    let (time_size, batch_size, _) = probs.dims3()?;
    if action.dims() != [time_size, batch_size] {
        return Err(TemporaError::shape(format!(
            "cannot index probabilities {:?} with actions {:?}",
            probs.dims(),
            action.dims()
        )));
    }
    let index = action.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;
    Ok(probs.gather(&index.contiguous()?, D::Minus1)?.squeeze(D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn unit_ratio_gives_minus_mean_advantage() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let advantages = Advantages(Tensor::new(&[[1f32, -2.], [0.5, 3.]], &device)?);
        let ratio = Tensor::ones((2, 2), DType::F32, &device)?;
        let loss = clipped_surrogate(&ratio, &advantages, 0.2)?.to_scalar::<f32>()?;
        assert!((loss + 0.625).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn large_ratios_are_clipped_pessimistically() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let advantages = Advantages(Tensor::new(&[1f32, -1.], &device)?);
        let ratio = Tensor::new(&[2f32, 2.], &device)?;
        // min(2, 1.2) = 1.2 for the positive advantage, min(-2, -1.2) = -2 for the negative one
        let loss = clipped_surrogate(&ratio, &advantages, 0.2)?.to_scalar::<f32>()?;
        assert!((loss - 0.4).abs() < 1e-6);
        let short = Tensor::new(&[1f32], &device)?;
        assert!(clipped_surrogate(&short, &advantages, 0.2).is_err());
        Ok(())
    }

    #[test]
    fn probabilities_of_taken_actions() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let probs = Tensor::new(
            &[[[0.1f32, 0.9], [0.7, 0.3]], [[0.4, 0.6], [0.2, 0.8]]],
            &device,
        )?;
        let action = Tensor::new(&[[1u32, 0], [0, 1]], &device)?;
        let picked: Vec<Vec<f32>> = index_3d(&probs, &action)?.to_vec2()?;
        assert_eq!(picked, vec![vec![0.9, 0.7], vec![0.4, 0.8]]);
        assert!(index_3d(&probs, &Tensor::new(&[1u32, 0], &device)?).is_err());
        Ok(())
    }

    #[test]
    fn value_loss_is_the_mean_square() -> anyhow::Result<()> {
        let td = Tensor::new(&[1f32, -3.], &Device::Cpu)?;
        assert_eq!(squared_td(&td)?.to_scalar::<f32>()?, 5.);
        Ok(())
    }
}
