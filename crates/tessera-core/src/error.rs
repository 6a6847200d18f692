//! Error types for Tessera Core.

use thiserror::Error;

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Errors that can occur while building or running a model.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// Invalid or unknown configuration.
    #[error("config error: {0}")]
    ConfigError(String),

    /// Tensor shape or position mismatch.
    #[error("shape error: {0}")]
    ShapeError(String),

    /// Operation called in the wrong lifecycle state.
    #[error("state error: {0}")]
    StateError(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

impl TesseraError {
    /// Whether this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }

    /// Whether this is a shape error.
    pub fn is_shape(&self) -> bool {
        matches!(self, Self::ShapeError(_))
    }

    /// Whether this is a lifecycle state error.
    pub fn is_state(&self) -> bool {
        matches!(self, Self::StateError(_))
    }
}
