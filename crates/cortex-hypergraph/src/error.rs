//! Error definitions for hypergraph operations.

use thiserror::Error;

use crate::models::ValidationError;

/// Standard crate result for operations that can fail with [`HypergraphError`].
pub type Result<T> = std::result::Result<T, HypergraphError>;

/// Errors covering domain, validation, and infrastructure failures.
#[derive(Debug, Error)]
pub enum HypergraphError {
    /// Tool vertex lookup miss.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Capability hyperedge lookup miss.
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    /// Vector dimensionality disagrees with the bootstrap dimension.
    /// Hard failure: the caller must refuse to start.
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    EmbeddingDimMismatch { expected: usize, got: usize },

    /// Domain validation failure.
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),

    /// Structural invariant breach that is logged rather than propagated as
    /// a hard failure (contains-cycle, conflicting re-upsert).
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// JSON serialization failure.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl HypergraphError {
    /// Whether the failure is attributable to the caller (4xx class).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            HypergraphError::ToolNotFound(_)
                | HypergraphError::CapabilityNotFound(_)
                | HypergraphError::ValidationError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HypergraphError::ToolNotFound("fs.read".into());
        assert_eq!(format!("{err}"), "Tool not found: fs.read");

        let err = HypergraphError::EmbeddingDimMismatch {
            expected: 1024,
            got: 768,
        };
        assert_eq!(
            format!("{err}"),
            "Embedding dimension mismatch: expected 1024, got 768"
        );
    }

    #[test]
    fn test_is_client_error() {
        assert!(HypergraphError::ToolNotFound("t".into()).is_client_error());
        assert!(HypergraphError::CapabilityNotFound("c".into()).is_client_error());
        assert!(!HypergraphError::InternalError("boom".into()).is_client_error());
    }
}
