//! Error definitions for the replay trainer and trace store.

use thiserror::Error;

/// Standard crate result.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Failures of the trace store and the training driver.
///
/// Trainer failures are non-fatal by contract: traces stay unconsumed and
/// parameters untouched, and the caller may retry on the next tick.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The training subprocess exceeded its wall-clock budget and was
    /// killed.
    #[error("Training timed out after {0} ms")]
    TrainTimeout(u64),

    /// The subprocess spoke, but not the expected wire format (or reported
    /// a kernel-side failure).
    #[error("Training protocol error: {0}")]
    TrainProtocolError(String),

    /// The subprocess died before producing a result.
    #[error("Training child crashed: {0}")]
    TrainChildCrash(String),

    /// A trace violated a store invariant and was rejected.
    #[error("Invalid trace: {0}")]
    InvalidTrace(String),

    /// Subprocess I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-format (de)serialization failure.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Model-side failure while importing the trained parameters.
    #[error("Model error: {0}")]
    Model(#[from] cortex_shgat::ShgatError),

    /// Intent embedding failure while building the batch.
    #[error("Embedding error: {0}")]
    Embedding(#[from] cortex_hypergraph::EmbeddingError),
}

impl ReplayError {
    /// Whether the caller should retry on the next training tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplayError::TrainTimeout(_)
                | ReplayError::TrainChildCrash(_)
                | ReplayError::Io(_)
        )
    }
}
