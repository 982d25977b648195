use crate::error::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

/// Global L2 norm of the gradients held for `vars`. Variables without a gradient are skipped.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f32> {
    let mut total_norm_squared = 0.0f32;
    for var in vars.iter() {
        if let Some(grad) = grads.get_id(var.id()) {
            total_norm_squared += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    Ok(total_norm_squared.sqrt())
}

/// Rescales the gradients of `vars` in place so that their global norm is at most `max_norm`
/// and returns the norm measured before clipping. A non positive bound disables clipping and
/// reports a norm of zero.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f32) -> Result<f32> {
    if max_norm <= 0. {
        return Ok(0.);
    }
    let total_norm = grad_norm(grads, vars)?;
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in vars.iter() {
            let Some(old_grad) = grads.get_id(var.id()) else {
                continue;
            };
            let clip_coef = Tensor::full(clip_coef, old_grad.shape(), old_grad.device())?;
            let new_grad = old_grad.broadcast_mul(&clip_coef)?;
            grads.insert(var.as_tensor(), new_grad);
        }
    }
    Ok(total_norm)
}
