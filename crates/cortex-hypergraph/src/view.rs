//! Immutable snapshot of the hypergraph packed for message passing.
//!
//! Scoring and training never touch the live store: they operate on a
//! [`GraphView`] extracted under one read lock, with dense indices so the
//! attention phases can iterate incidence sets without hashing or allocating.

use std::collections::HashMap;

/// Weighted tool→tool co-occurrence edge in dense-index form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CooccurrenceEdge {
    pub from: usize,
    pub to: usize,
    pub weight: f32,
}

/// Dense snapshot of the bipartite hypergraph.
///
/// Capabilities are flattened in (level, id) order so the flat index of a
/// capability and its (level, offset) coordinates convert both ways; the
/// model routes gradients through that map.
#[derive(Debug, Clone, Default)]
pub struct GraphView {
    /// Embedding dimensionality of every vector below.
    pub dim: usize,

    /// Tool ids, dense index order.
    pub tool_ids: Vec<String>,
    /// One embedding row per tool.
    pub tool_embeddings: Vec<Vec<f32>>,
    /// Posterior success rate per tool.
    pub tool_success: Vec<f32>,

    /// Capability ids, flattened in (level, id) order.
    pub cap_ids: Vec<String>,
    /// Level of each flat capability.
    pub cap_levels: Vec<usize>,
    /// One embedding row per capability.
    pub cap_embeddings: Vec<Vec<f32>>,
    /// Posterior success rate per capability.
    pub cap_success: Vec<f32>,

    /// Incidence sets: flat capability index → sorted tool indices.
    pub incidence: Vec<Vec<usize>>,
    /// Composition: flat capability index → flat child capability indices.
    pub children: Vec<Vec<usize>>,
    /// Flat capability indices grouped by level.
    pub levels: Vec<Vec<usize>>,

    /// Tool co-occurrence overlay for the V→V phase.
    pub cooccurrence: Vec<CooccurrenceEdge>,

    tool_index: HashMap<String, usize>,
    cap_index: HashMap<String, usize>,
}

impl GraphView {
    /// Assembles a view from dense parts. The store is the canonical
    /// producer; tests and benches build synthetic views directly.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        dim: usize,
        tool_ids: Vec<String>,
        tool_embeddings: Vec<Vec<f32>>,
        tool_success: Vec<f32>,
        cap_ids: Vec<String>,
        cap_levels: Vec<usize>,
        cap_embeddings: Vec<Vec<f32>>,
        cap_success: Vec<f32>,
        incidence: Vec<Vec<usize>>,
        children: Vec<Vec<usize>>,
        cooccurrence: Vec<CooccurrenceEdge>,
    ) -> Self {
        let tool_index = tool_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let cap_index: HashMap<String, usize> = cap_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let max_level = cap_levels.iter().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); max_level + 1];
        for (flat, level) in cap_levels.iter().enumerate() {
            levels[*level].push(flat);
        }

        Self {
            dim,
            tool_ids,
            tool_embeddings,
            tool_success,
            cap_ids,
            cap_levels,
            cap_embeddings,
            cap_success,
            incidence,
            children,
            levels,
            cooccurrence,
            tool_index,
            cap_index,
        }
    }

    /// Dense index of a tool id.
    pub fn tool_index_of(&self, id: &str) -> Option<usize> {
        self.tool_index.get(id).copied()
    }

    /// Flat index of a capability id.
    pub fn cap_index_of(&self, id: &str) -> Option<usize> {
        self.cap_index.get(id).copied()
    }

    /// Highest populated capability level.
    pub fn max_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// `|V| + |E|`, the input to adaptive head sizing.
    pub fn graph_size(&self) -> usize {
        self.tool_ids.len() + self.cap_ids.len()
    }

    /// Converts a flat capability index to (level, within-level offset).
    pub fn coords_of(&self, flat: usize) -> Option<(usize, usize)> {
        let level = *self.cap_levels.get(flat)?;
        let offset = self.levels[level].iter().position(|f| *f == flat)?;
        Some((level, offset))
    }

    /// Converts (level, within-level offset) back to a flat capability index.
    pub fn flat_of(&self, level: usize, offset: usize) -> Option<usize> {
        self.levels.get(level)?.get(offset).copied()
    }

    /// Whether the snapshot carries any co-occurrence signal for V→V.
    pub fn has_cooccurrence(&self) -> bool {
        !self.cooccurrence.is_empty()
    }
}
