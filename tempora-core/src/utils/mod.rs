pub mod clip_grad;
pub mod device;
pub mod metrics;
pub mod time_unit;

pub use clip_grad::{clip_grad_norm, grad_norm};
pub use device::ensure_on_device;
pub use metrics::{ensure_finite, masked_mean};
pub use time_unit::compute_time_unit;
