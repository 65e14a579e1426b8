//! Message-passing phases.
//!
//! `attention` is the grouped template behind V→E, E→E upward, E→E
//! downward, and E→V; `v2v` is the co-occurrence enrichment that runs
//! before any hyperedge aggregation.

pub mod attention;
pub mod v2v;

pub use attention::{AttentionCache, AttentionGrads};
pub use v2v::V2vCache;
