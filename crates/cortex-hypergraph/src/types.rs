//! Embedding vector type shared by intents, tools, and capabilities.

use serde::{Deserialize, Serialize};

/// Default number of embedding dimensions when `EMBEDDING_DIM` is unset.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1024;

/// Dense embedding vector.
///
/// The dimension is fixed at bootstrap; stores validate every incoming vector
/// against it and the value is immutable once attached to a vertex or edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Creates an embedding validating against the expected dimension.
    pub fn with_dimension(values: Vec<f32>, expected: usize) -> Result<Self, String> {
        if values.len() != expected {
            return Err(format!(
                "Invalid embedding dimension: {} (expected {expected})",
                values.len()
            ));
        }
        Ok(Self(values))
    }

    /// Creates an embedding without validation (internal, controlled use).
    pub fn new_unchecked(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Returns the dimensionality.
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Dot product with another embedding of the same dimension.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Cosine similarity; zero when either vector has zero norm.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        let denom = self.norm() * other.norm();
        if denom <= f32::EPSILON {
            return 0.0;
        }
        self.dot(other) / denom
    }

    /// Returns a unit-normalized copy; the zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        if norm <= f32::EPSILON {
            return self.clone();
        }
        Embedding(self.0.iter().map(|v| v / norm).collect())
    }
}

impl std::ops::Deref for Embedding {
    type Target = Vec<f32>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.0
    }
}
