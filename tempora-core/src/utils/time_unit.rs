use crate::error::Result;
use candle_core::{DType, Device, Tensor};
use std::time::Instant;

const BENCH_SIZE: usize = 256;
const BENCH_ITERATIONS: usize = 32;

/// Seconds the device needs for a fixed matmul workload.
///
/// Time based stop criteria are expressed in multiples of this unit, so the same limit means
/// roughly the same amount of work on a fast and on a slow machine.
pub fn compute_time_unit(device: &Device) -> Result<f64> {
    let lhs = Tensor::ones((BENCH_SIZE, BENCH_SIZE), DType::F32, device)?;
    let mut acc = Tensor::eye(BENCH_SIZE, DType::F32, device)?;
    let start = Instant::now();
    for _ in 0..BENCH_ITERATIONS {
        acc = (lhs.matmul(&acc)? / BENCH_SIZE as f64)?;
    }
    // forces the lazy backends to finish
    acc.sum_all()?.to_scalar::<f32>()?;
    let unit = start.elapsed().as_secs_f64();
    tracing::debug!(unit, "time unit calibrated");
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_is_positive() -> anyhow::Result<()> {
        let unit = compute_time_unit(&Device::Cpu)?;
        assert!(unit > 0.);
        Ok(())
    }
}
