//! Error type for the bi-encoder training core.
//!
//! # Design Principles
//!
//! - **NO FALLBACKS**: configuration errors propagate, never silently default
//! - **FAIL FAST**: invalid loss/target pairings and misaligned batches are
//!   rejected before any tensor math runs
//! - **CONTEXTUAL**: every variant carries the values needed for debugging

use thiserror::Error;

/// Error type for encoder construction, forward passes, and persistence.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Invalid configuration (unknown loss/pooling name, non-positive
    /// temperature, gather without an initialized distributed runtime).
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Tensor operation failed (wraps the backend error message).
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    /// A named tensor expected in a token batch was not provided.
    #[error("Token batch is missing tensor '{name}'")]
    MissingTensor { name: String },

    /// Element- or axis-count mismatch between two tensors that must align.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Implicit-target construction requires the passage count to be an
    /// exact multiple of the query count.
    #[error("Passage count {passages} is not a multiple of query count {queries}")]
    UnalignedBatch { queries: usize, passages: usize },

    /// File I/O failed (checkpoint directories, weight files).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Checkpoint or sidecar (de)serialization failed.
    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

/// Result type alias for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;
