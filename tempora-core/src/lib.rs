pub mod advantage;
pub mod agent;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod logger;
pub mod snapshot;
pub mod utils;
pub mod workspace;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use error::{Result, TemporaError};
pub use workspace::{StreamKey, Workspace};
