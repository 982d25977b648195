use crate::error::{Result, TemporaError};
use candle_core::{Device, Var};

/// Fails with `DeviceMismatch` on the first of `vars` not living on `device`.
pub fn ensure_on_device(vars: &[Var], device: &Device) -> Result<()> {
    match vars.iter().find(|var| !var.device().same_device(device)) {
        Some(var) => Err(TemporaError::DeviceMismatch {
            expected: format!("{device:?}"),
            got: format!("{:?}", var.device()),
        }),
        None => Ok(()),
    }
}
