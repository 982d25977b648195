use crate::workspace::StreamKey;
use thiserror::Error;

/// Everything that can go wrong while acquiring, sampling or learning from a workspace.
#[derive(Debug, Error)]
pub enum TemporaError {
    /// Malformed configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("stream `{key}` has no value at time {t} (time size is {time_size})")]
    OutOfRange {
        key: StreamKey,
        t: usize,
        time_size: usize,
    },
    #[error("stream `{0}` does not exist in the workspace")]
    MissingStream(StreamKey),
    #[error("advantage estimation needs at least 2 time steps, got {time_size}")]
    InsufficientHorizon { time_size: usize },
    #[error("non finite values detected in `{key}`")]
    NumericalInstability { key: StreamKey },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: String, got: String },
    #[error("worker {worker} failed: {reason}")]
    WorkerFailed { worker: usize, reason: String },
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TemporaError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TemporaError>;
