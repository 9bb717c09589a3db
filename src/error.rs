//! Error types for rnnforge

use thiserror::Error;

/// Rnnforge error type
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Input/target vector length does not match the compiled slot lists
    #[error("shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// The object graph violates a structural invariant
    #[error("graph invariant violated: {0}")]
    GraphInvariant(String),

    /// Compilation error
    #[error("compilation error: {0}")]
    Compilation(String),

    /// Binary format error
    #[error("binary format error: {0}")]
    BinaryFormat(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
