//! Error definitions for the gateway facade.

use thiserror::Error;

/// Standard crate result.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failures of the serving and administration surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Provider and configuration disagree on the embedding dimension.
    /// Raised at bootstrap; the gateway refuses to start.
    #[error("Embedding dimension mismatch: config {config}, provider {provider}")]
    EmbeddingDimMismatch { config: usize, provider: usize },

    #[error("Hypergraph error: {0}")]
    Hypergraph(#[from] cortex_hypergraph::HypergraphError),

    #[error("Model error: {0}")]
    Model(#[from] cortex_shgat::ShgatError),

    #[error("Replay error: {0}")]
    Replay(#[from] cortex_replay::ReplayError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] cortex_hypergraph::EmbeddingError),

    #[error("Parameter store error: {0}")]
    ParamStore(String),
}
