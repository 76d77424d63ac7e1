//! Error types for the runtime crate.

use ember_core::DataType;
use thiserror::Error;

/// Runtime execution errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Buffer allocation failed.
    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    /// Shapes don't fit the operation.
    #[error("Dimension error: {0}")]
    Dimension(String),

    /// Element types don't fit the operation.
    #[error("Data type mismatch: expected {expected}, got {actual}")]
    DTypeMismatch {
        expected: DataType,
        actual: DataType,
    },

    /// An operation is not legal while a stream is being captured, or a
    /// capture was used incorrectly.
    #[error("Graph capture error: {0}")]
    Capture(String),

    /// A captured graph was replayed with the wrong number of inputs.
    #[error("Expected {expected} input tensors, got {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },

    /// No operator is registered for a graph node.
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Invalid tensor.
    #[error("Invalid tensor: {0}")]
    Tensor(String),

    /// Graph structure or attribute error.
    #[error(transparent)]
    Graph(#[from] ember_core::Error),
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
