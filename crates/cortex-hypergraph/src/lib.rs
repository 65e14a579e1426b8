//! Public core of the `cortex-hypergraph` crate.
//!
//! Exposes the domain models, error types, the in-memory
//! [`HypergraphStore`], the dense [`GraphView`] snapshot consumed by scoring
//! and training, and the [`EmbeddingProvider`] port.

pub mod embeddings;
pub mod error;
pub mod models;
pub mod store;
pub mod traversal;
pub mod types;
pub mod view;

pub use embeddings::{EmbeddingError, EmbeddingProvider, HashedMockProvider};
pub use error::{HypergraphError, Result};
pub use models::{
    Capability, DependencyEdge, DependencyKind, EdgeSource, EdgeType, PermissionSet,
    SuccessCounter, ToolVertex, ValidationError,
};
pub use store::HypergraphStore;
pub use traversal::{contains_would_cycle, shortest_path_weighted, WeightedPath};
pub use types::{Embedding, DEFAULT_EMBEDDING_DIMENSION};
pub use view::{CooccurrenceEdge, GraphView};

/// Common imports for consumers of the hypergraph.
pub mod prelude {
    pub use crate::{
        embeddings::{EmbeddingError, EmbeddingProvider},
        error::{HypergraphError, Result},
        models::{Capability, DependencyKind, EdgeSource, EdgeType, ToolVertex},
        store::HypergraphStore,
        types::Embedding,
        view::GraphView,
    };
}
