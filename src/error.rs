//! Error types for tensor and inference operations

use thiserror::Error;

/// Error type for all fallible operations in the crate
#[derive(Debug, Error)]
pub enum InferirError {
    /// Tensor shape is invalid for the requested construction
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the shape violation
        reason: String,
    },

    /// Data length does not match the declared shape
    #[error("Data/shape mismatch: shape needs {expected} elements, got {actual}")]
    DataShapeMismatch {
        /// Element count implied by the shape
        expected: usize,
        /// Element count actually provided
        actual: usize,
    },

    /// A kernel backend does not implement the requested dtype pairing
    #[error("Unsupported operation: {op} for {left:?} x {right:?}")]
    UnsupportedOperation {
        /// Operation name
        op: &'static str,
        /// Left operand encoding
        left: crate::dtype::DType,
        /// Right operand encoding
        right: crate::dtype::DType,
    },

    /// Tensor size is not a multiple of the encoding's block size
    #[error("Size {size} is not a multiple of block size {block_size} for {dtype:?}")]
    BlockMisaligned {
        /// Total element count
        size: usize,
        /// Required block size
        block_size: usize,
        /// Encoding being constructed
        dtype: crate::dtype::DType,
    },

    /// A shard partition does not divide its axis exactly
    #[error("Invalid partition: {axis} of {length} does not divide into {shards} shards")]
    InvalidPartition {
        /// Name of the partitioned axis
        axis: &'static str,
        /// Axis length
        length: usize,
        /// Requested shard count
        shards: usize,
    },

    /// Model configuration is inconsistent
    #[error("Invalid config: {reason}")]
    InvalidConfig {
        /// Description of the inconsistency
        reason: String,
    },

    /// A named weight was not present in the weight source
    #[error("Missing weight: {name}")]
    MissingWeight {
        /// Fully qualified weight name
        name: String,
    },

    /// Generation was asked to run past the configured context length
    #[error("Context overflow: position {position} exceeds context length {context_length}")]
    ContextOverflow {
        /// Requested position
        position: usize,
        /// Configured maximum
        context_length: usize,
    },
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, InferirError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn error_messages_are_descriptive() {
        let err = InferirError::InvalidShape {
            reason: "tensors require at least 2 dimensions".to_string(),
        };
        assert!(err.to_string().contains("at least 2 dimensions"));

        let err = InferirError::UnsupportedOperation {
            op: "dot_product",
            left: DType::Q4,
            right: DType::Q5,
        };
        assert!(err.to_string().contains("dot_product"));
        assert!(err.to_string().contains("Q4"));

        let err = InferirError::InvalidPartition {
            axis: "embedding",
            length: 100,
            shards: 3,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("3 shards"));
    }
}
