//! Error definitions for the attention runtime.

use thiserror::Error;

/// Standard crate result for operations that can fail with [`ShgatError`].
pub type Result<T> = std::result::Result<T, ShgatError>;

/// Failures surfaced by the model and parameter machinery.
///
/// Shape mismatches inside pure forward/backward code are programming
/// errors and assert in debug builds; this enum covers the recoverable
/// boundary failures.
#[derive(Debug, Error)]
pub enum ShgatError {
    /// An imported parameter blob disagrees with the expected tensor shapes
    /// or schema version. The import is rejected and in-memory parameters
    /// are kept.
    #[error("Parameter schema mismatch: {0}")]
    ParamSchemaMismatch(String),

    /// Input vector dimensionality disagrees with the model dimension.
    #[error("Invalid input dimension: expected {expected}, got {got}")]
    InvalidDimension { expected: usize, got: usize },

    /// A training batch referenced a candidate index outside the view.
    #[error("Candidate index {index} out of range ({len} candidates)")]
    CandidateOutOfRange { index: usize, len: usize },

    /// A training batch was empty or otherwise unusable.
    #[error("Invalid training batch: {0}")]
    InvalidBatch(String),

    /// JSON serialization failure while exporting or importing parameters.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
