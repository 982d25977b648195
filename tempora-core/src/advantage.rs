use crate::error::{Result, TemporaError};
use candle_core::{DType, Tensor};

fn horizon(critic: &Tensor, reward: &Tensor, done: &Tensor) -> Result<usize> {
    let time_size = critic.dims().first().copied().unwrap_or(0);
    if time_size < 2 {
        return Err(TemporaError::InsufficientHorizon { time_size });
    }
    if reward.dims() != critic.dims() || done.dims() != critic.dims() {
        return Err(TemporaError::shape(format!(
            "critic {:?}, reward {:?} and done {:?} must share one shape",
            critic.dims(),
            reward.dims(),
            done.dims()
        )));
    }
    Ok(time_size)
}

// 1 - done[1..]
fn next_not_done(done: &Tensor, time_size: usize) -> Result<Tensor> {
    Ok(done
        .narrow(0, 1, time_size - 1)?
        .to_dtype(DType::F32)?
        .affine(-1., 1.)?)
}

/// One step TD error over `[T, B]` streams, `T - 1` rows long.
///
/// `td[t] = reward[t+1] + gamma * critic[t+1] * (1 - done[t+1]) - critic[t]`. The bootstrap
/// value `critic[t+1]` is detached, gradients only flow into `critic[t]`, so the square of the
/// result is directly usable as a critic loss.
pub fn temporal_difference(
    critic: &Tensor,
    reward: &Tensor,
    done: &Tensor,
    gamma: f64,
) -> Result<Tensor> {
    let time_size = horizon(critic, reward, done)?;
    let not_done = next_not_done(done, time_size)?;
    let bootstrap = critic.narrow(0, 1, time_size - 1)?.detach();
    let target = (reward.narrow(0, 1, time_size - 1)? + (bootstrap * gamma)?.mul(&not_done)?)?;
    Ok(target.sub(&critic.narrow(0, 0, time_size - 1)?)?)
}

/// Generalized advantage estimate over `[T, B]` streams, `T - 1` rows long.
///
/// Computed on a detached critic: the result never backpropagates into the value function.
pub fn gae(
    critic: &Tensor,
    reward: &Tensor,
    done: &Tensor,
    gamma: f64,
    lambda: f64,
) -> Result<Tensor> {
    let critic = critic.detach();
    let td = temporal_difference(&critic, reward, done, gamma)?;
    let time_size = critic.dim(0)?;
    let not_done = next_not_done(done, time_size)?;
    let mut last = td.get(time_size - 2)?;
    let mut advantages = vec![last.clone()];
    for t in (0..time_size - 2).rev() {
        last = (td.get(t)? + (last * (gamma * lambda))?.mul(&not_done.get(t)?)?)?;
        advantages.push(last.clone());
    }
    advantages.reverse();
    Ok(Tensor::stack(&advantages, 0)?)
}
