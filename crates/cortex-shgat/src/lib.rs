//! SuperHyperGraph attention network runtime.
//!
//! Message-passing phases over the tool/capability hypergraph, the K-head
//! attention scorer, contrastive training, and the parameter export/import
//! boundary. All tensors preserve the bootstrap embedding dimension end to
//! end; that is a correctness contract of the serialized parameters, not an
//! optimization.

pub mod adaptive;
pub mod error;
pub mod linalg;
pub mod model;
pub mod orchestrator;
pub mod params;
pub mod phases;

pub use adaptive::{adaptive_heads_by_graph_size, HeadPlan, MAX_HEADS};
pub use error::{Result, ShgatError};
pub use model::{
    bce_backward, info_nce_backward, reliability_multiplier, sample_negatives, score_candidates,
    train_epoch_flat, train_step_graph, BinaryExample, ContrastiveBackward, ContrastiveExample,
    ScoredCandidate, ShgatModel, TrainOptions, TrainStats, GRAD_CLIP_NORM,
};
pub use orchestrator::{MultiLevelGrads, MultiLevelOrchestrator, Propagated, PropagationCache};
pub use params::{
    HeadParams, LevelGrads, LevelParams, ShgatGrads, ShgatParams, V2vGrads, V2vParams,
    PARAM_SCHEMA_VERSION,
};
