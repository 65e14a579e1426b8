//! Adaptive head sizing.
//!
//! The head count is a pure function of graph size (`|V| + |E|`) and the
//! maximum composition level, so two processes looking at the same graph
//! always agree on parameter shapes.

use serde::{Deserialize, Serialize};

/// Resolved attention geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadPlan {
    pub num_heads: usize,
    pub head_dim: usize,
    pub hidden_dim: usize,
    pub scoring_dim: usize,
}

/// Hard ceiling on the head count.
pub const MAX_HEADS: usize = 16;

/// Graph size at which the per-head dimension doubles.
pub const WIDE_HEAD_THRESHOLD: usize = 200;

/// Maps graph size and max level to the attention geometry.
///
/// Monotone non-decreasing in both arguments. `hidden_dim` always equals
/// `num_heads · head_dim`.
pub fn adaptive_heads_by_graph_size(graph_size: usize, max_level: usize) -> HeadPlan {
    let base = match graph_size {
        0..=49 => 4,
        50..=199 => 6,
        200..=499 => 8,
        500..=999 => 12,
        _ => 14,
    };

    let bonus = match max_level {
        0 | 1 => 0,
        2 => 1,
        _ => 2,
    };

    let num_heads = (base + bonus).min(MAX_HEADS);
    let head_dim = if graph_size >= WIDE_HEAD_THRESHOLD {
        32
    } else {
        16
    };

    HeadPlan {
        num_heads,
        head_dim,
        hidden_dim: num_heads * head_dim,
        scoring_dim: head_dim,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_matches_size_table() {
        assert_eq!(adaptive_heads_by_graph_size(10, 0).num_heads, 4);
        assert_eq!(adaptive_heads_by_graph_size(49, 0).num_heads, 4);
        assert_eq!(adaptive_heads_by_graph_size(50, 0).num_heads, 6);
        assert_eq!(adaptive_heads_by_graph_size(199, 0).num_heads, 6);
        assert_eq!(adaptive_heads_by_graph_size(200, 0).num_heads, 8);
        assert_eq!(adaptive_heads_by_graph_size(500, 0).num_heads, 12);
        assert_eq!(adaptive_heads_by_graph_size(1000, 0).num_heads, 14);
        assert_eq!(adaptive_heads_by_graph_size(5000, 3).num_heads, 16);
    }

    #[test]
    fn test_level_bonus() {
        assert_eq!(adaptive_heads_by_graph_size(100, 1).num_heads, 6);
        assert_eq!(adaptive_heads_by_graph_size(100, 2).num_heads, 7);
        assert_eq!(adaptive_heads_by_graph_size(100, 3).num_heads, 8);
        assert_eq!(adaptive_heads_by_graph_size(100, 4).num_heads, 8);
        // The cap binds at the top of the table.
        assert_eq!(adaptive_heads_by_graph_size(2000, 2).num_heads, 15);
        assert_eq!(adaptive_heads_by_graph_size(2000, 5).num_heads, 16);
    }

    #[test]
    fn test_head_dim_widens_at_threshold() {
        assert_eq!(adaptive_heads_by_graph_size(199, 0).head_dim, 16);
        assert_eq!(adaptive_heads_by_graph_size(200, 0).head_dim, 32);
    }

    #[test]
    fn test_hidden_dim_for_narrow_heads() {
        assert_eq!(adaptive_heads_by_graph_size(10, 0).hidden_dim, 64);
        assert_eq!(adaptive_heads_by_graph_size(100, 0).hidden_dim, 96);
    }

    proptest! {
        #[test]
        fn prop_monotone_in_graph_size(size in 0usize..3000, level in 0usize..4) {
            let smaller = adaptive_heads_by_graph_size(size, level);
            let larger = adaptive_heads_by_graph_size(size + 1, level);
            prop_assert!(larger.num_heads >= smaller.num_heads);
            prop_assert!(larger.head_dim >= smaller.head_dim);
        }

        #[test]
        fn prop_monotone_in_level(size in 0usize..3000, level in 0usize..4) {
            let lower = adaptive_heads_by_graph_size(size, level);
            let higher = adaptive_heads_by_graph_size(size, level + 1);
            prop_assert!(higher.num_heads >= lower.num_heads);
        }

        #[test]
        fn prop_hidden_dim_invariant(size in 0usize..3000, level in 0usize..4) {
            let plan = adaptive_heads_by_graph_size(size, level);
            prop_assert_eq!(plan.hidden_dim, plan.num_heads * plan.head_dim);
            prop_assert!(plan.num_heads <= MAX_HEADS);
        }
    }
}
