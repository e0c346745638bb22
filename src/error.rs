//! Error types for lora-inject.

use thiserror::Error;

/// Result type alias for lora-inject operations.
pub type Result<T> = std::result::Result<T, LoraError>;

/// Errors that can occur while building, injecting or restoring adapters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LoraError {
    /// Adapter hyperparameters violate a construction precondition.
    #[error("invalid adapter configuration: {0}")]
    InvalidAdapterConfig(String),

    /// The host graph is inconsistent (e.g. two siblings share a name).
    #[error("graph traversal error at '{path}': {message}")]
    GraphTraversal {
        /// Dotted path of the offending module
        path: String,
        /// Descriptive message
        message: String,
    },

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: {message}")]
    DimensionMismatch {
        /// Descriptive message
        message: String,
    },

    /// Reading or writing adapter files failed.
    #[error("io error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
