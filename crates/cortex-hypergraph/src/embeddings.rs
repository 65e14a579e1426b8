//! Embedding provider port.
//!
//! The gateway consumes embeddings through this trait only; concrete remote
//! providers live with the transport. The crate ships a deterministic mock
//! used by tests and local bootstraps.

use async_trait::async_trait;

use crate::types::Embedding;

/// Specialized error for embedding generation.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Upstream service error: {0}")]
    Upstream(String),
    #[error("Invalid embedding dimension: expected {expected}, got {got}")]
    InvalidDimension { expected: usize, got: usize },
    #[error("Empty embedding response")]
    EmptyResponse,
    #[error("Internal embedding error: {0}")]
    Internal(String),
}

impl EmbeddingError {
    /// Whether the failure is potentially transient (eligible for retry).
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Upstream(_))
    }
}

/// Asynchronous source of fixed-dimension, unit-normalized embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Encodes one text into a unit-normalized vector of [`Self::dimension`]
    /// components.
    async fn encode(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Encodes a batch, preserving input order.
    async fn batch_encode(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut outputs = Vec::with_capacity(texts.len());
        for text in texts {
            outputs.push(self.encode(text).await?);
        }
        Ok(outputs)
    }

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Deterministic mock provider: hashes text bytes into a stable direction and
/// unit-normalizes it. Identical inputs always produce identical vectors.
pub struct HashedMockProvider {
    dimension: usize,
}

impl HashedMockProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn raw_vector(&self, text: &str) -> Vec<f32> {
        let bytes = text.as_bytes();
        let mut values = vec![0.0f32; self.dimension];
        if bytes.is_empty() {
            values[0] = 1.0;
            return values;
        }
        // FNV-style rolling hash spread across the dimensions.
        let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
        for (idx, value) in values.iter_mut().enumerate() {
            let byte = bytes[idx % bytes.len()];
            acc ^= byte as u64 ^ (idx as u64) << 8;
            acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
            *value = ((acc >> 32) as f32 / u32::MAX as f32) * 2.0 - 1.0;
        }
        values
    }
}

#[async_trait]
impl EmbeddingProvider for HashedMockProvider {
    async fn encode(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let raw = Embedding::from(self.raw_vector(text));
        Ok(raw.normalized())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hashed-mock-provider"
    }
}
