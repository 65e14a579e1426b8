//! In-memory hypergraph store.
//!
//! One `RwLock` guards the whole graph state: mutation takes the write lock
//! for a short, I/O-free critical section, while scoring extracts a
//! [`GraphView`] snapshot under the read lock and computes outside it.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::{HypergraphError, Result};
use crate::models::{
    Capability, DependencyEdge, DependencyKind, EdgeSource, EdgeType, PermissionSet, ToolVertex,
    ValidationError,
};
use crate::traversal::{contains_would_cycle, shortest_path_weighted, WeightedPath};
use crate::types::Embedding;
use crate::view::{CooccurrenceEdge, GraphView};

#[derive(Debug, Default)]
struct GraphState {
    tools: HashMap<String, ToolVertex>,
    caps: HashMap<String, Capability>,
    cap_edges: HashMap<(String, String), DependencyEdge>,
    tool_edges: HashMap<(String, String), DependencyEdge>,
}

/// Weighted bipartite hypergraph of tool vertices and capability hyperedges,
/// plus the cap→cap and tool→tool dependency overlays.
pub struct HypergraphStore {
    state: RwLock<GraphState>,
    dim: usize,
    max_level: usize,
}

impl HypergraphStore {
    /// Creates an empty store with a fixed embedding dimension and maximum
    /// composition level.
    pub fn new(dim: usize, max_level: usize) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            dim,
            max_level,
        }
    }

    /// Bootstrap embedding dimension.
    pub fn dimension(&self) -> usize {
        self.dim
    }

    fn check_dimension(&self, embedding: &Embedding) -> Result<()> {
        if embedding.dimension() != self.dim {
            return Err(HypergraphError::EmbeddingDimMismatch {
                expected: self.dim,
                got: embedding.dimension(),
            });
        }
        Ok(())
    }

    /// Idempotently inserts a tool vertex.
    ///
    /// Re-upserting an existing id with the same embedding merges silently;
    /// a conflicting embedding is an invariant violation that is logged and
    /// dropped (embeddings are immutable).
    pub fn upsert_tool(&self, id: &str, embedding: Embedding) -> Result<()> {
        self.check_dimension(&embedding)?;

        let mut state = self.state.write();
        if let Some(existing) = state.tools.get(id) {
            if existing.embedding != embedding {
                warn!(tool = id, "re-upsert with conflicting embedding ignored");
            }
            return Ok(());
        }

        let vertex = ToolVertex::new(id, embedding).map_err(HypergraphError::ValidationError)?;
        state.tools.insert(id.to_string(), vertex);
        debug!(tool = id, "tool vertex created");
        Ok(())
    }

    /// Idempotently inserts a capability hyperedge.
    ///
    /// Level-0 capabilities carry their own invocation bundle; level-k≥1
    /// capabilities list children and receive the union of their children's
    /// incidence sets. Missing children are a client error.
    pub fn upsert_capability(
        &self,
        id: &str,
        level: usize,
        embedding: Embedding,
        children: &[String],
        invocations: Vec<String>,
    ) -> Result<()> {
        self.check_dimension(&embedding)?;
        if level > self.max_level {
            return Err(ValidationError::LevelOutOfRange {
                got: level,
                max: self.max_level,
            }
            .into());
        }

        let mut state = self.state.write();
        if let Some(existing) = state.caps.get(id) {
            if existing.embedding != embedding {
                warn!(
                    capability = id,
                    "re-upsert with conflicting embedding ignored"
                );
                return Ok(());
            }
        }

        let mut cap = if level == 0 {
            Capability::atomic(id, embedding, invocations)
                .map_err(HypergraphError::ValidationError)?
        } else {
            let mut cap = Capability::composite(id, level, embedding, children.to_vec())
                .map_err(HypergraphError::ValidationError)?;

            // Incidence invariant: union of the children's incidence sets,
            // with the ordered invocation stream concatenated child-by-child.
            for child_id in children {
                let child = state
                    .caps
                    .get(child_id)
                    .ok_or_else(|| ValidationError::UnknownChild(child_id.clone()))?;
                if child.level + 1 != level {
                    warn!(
                        capability = id,
                        child = child_id.as_str(),
                        child_level = child.level,
                        "child level does not compose into parent level"
                    );
                }
                cap.tools_used.extend(child.tools_used.iter().cloned());
                cap.tool_invocations
                    .extend(child.tool_invocations.iter().cloned());
            }
            cap
        };

        // Preserve accumulated outcome counts and permissions on re-upsert.
        if let Some(existing) = state.caps.get(id) {
            cap.success = existing.success;
            cap.permissions = existing.permissions;
            cap.parents = existing.parents.clone();
        }

        for child_id in &cap.children {
            if let Some(child) = state.caps.get_mut(child_id) {
                child.parents.insert(id.to_string());
            }
        }

        state.caps.insert(id.to_string(), cap);
        debug!(capability = id, level, "capability upserted");
        Ok(())
    }

    /// Sets the permission tier of a capability.
    pub fn set_permissions(&self, id: &str, permissions: PermissionSet) -> Result<()> {
        let mut state = self.state.write();
        let cap = state
            .caps
            .get_mut(id)
            .ok_or_else(|| HypergraphError::CapabilityNotFound(id.to_string()))?;
        cap.permissions = permissions;
        Ok(())
    }

    /// Creates or reinforces a dependency edge.
    ///
    /// Self-loops are rejected. A `contains` edge that would close a cycle is
    /// logged and dropped (the overlay stays a DAG). Re-assertion bumps
    /// `observed_count`, promotes inferred→observed at the threshold, and
    /// upgrades the edge type when the new assertion carries more weight, so
    /// the effective weight never decreases.
    pub fn add_edge(
        &self,
        kind: DependencyKind,
        from: &str,
        to: &str,
        edge_type: EdgeType,
        edge_source: EdgeSource,
    ) -> Result<()> {
        if from == to {
            return Err(ValidationError::SelfLoop(from.to_string()).into());
        }

        let mut state = self.state.write();
        match kind {
            DependencyKind::ToolTool => {
                if !state.tools.contains_key(from) {
                    return Err(HypergraphError::ToolNotFound(from.to_string()));
                }
                if !state.tools.contains_key(to) {
                    return Err(HypergraphError::ToolNotFound(to.to_string()));
                }
            }
            DependencyKind::CapCap => {
                if !state.caps.contains_key(from) {
                    return Err(HypergraphError::CapabilityNotFound(from.to_string()));
                }
                if !state.caps.contains_key(to) {
                    return Err(HypergraphError::CapabilityNotFound(to.to_string()));
                }
            }
        }

        let edges = match kind {
            DependencyKind::CapCap => &mut state.cap_edges,
            DependencyKind::ToolTool => &mut state.tool_edges,
        };

        let key = (from.to_string(), to.to_string());
        if let Some(edge) = edges.get_mut(&key) {
            edge.reinforce(edge_source);
            let asserted = DependencyEdge::new(from, to, edge_type, edge.edge_source)
                .map_err(HypergraphError::ValidationError)?;
            if asserted.weight() > edge.weight() {
                edge.edge_type = edge_type;
            }
            debug!(
                %edge_type,
                from,
                to,
                count = edge.observed_count,
                source = %edge.edge_source,
                "dependency edge reinforced"
            );
            return Ok(());
        }

        if edge_type == EdgeType::Contains && contains_would_cycle(edges, from, to) {
            warn!(from, to, "contains edge would close a cycle, dropped");
            return Ok(());
        }

        let edge = DependencyEdge::new(from, to, edge_type, edge_source)
            .map_err(HypergraphError::ValidationError)?;
        edges.insert(key, edge);
        debug!(%edge_type, %edge_source, from, to, "dependency edge created");
        Ok(())
    }

    /// Looks up a dependency edge.
    pub fn edge(&self, kind: DependencyKind, from: &str, to: &str) -> Option<DependencyEdge> {
        let state = self.state.read();
        let edges = match kind {
            DependencyKind::CapCap => &state.cap_edges,
            DependencyKind::ToolTool => &state.tool_edges,
        };
        edges.get(&(from.to_string(), to.to_string())).cloned()
    }

    /// Records an execution outcome against a tool or capability, updating
    /// its beta counters (and `last_used` for tools).
    pub fn record_outcome(&self, id: &str, success: bool) -> Result<()> {
        let mut state = self.state.write();
        if let Some(tool) = state.tools.get_mut(id) {
            tool.success.record(success);
            tool.last_used = Some(Utc::now());
            return Ok(());
        }
        if let Some(cap) = state.caps.get_mut(id) {
            cap.success.record(success);
            return Ok(());
        }
        Err(HypergraphError::ToolNotFound(id.to_string()))
    }

    /// Tombstones a tool vertex; it stays resolvable but leaves the view.
    pub fn tombstone_tool(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let tool = state
            .tools
            .get_mut(id)
            .ok_or_else(|| HypergraphError::ToolNotFound(id.to_string()))?;
        tool.tombstoned = true;
        Ok(())
    }

    /// Clone of a tool vertex.
    pub fn tool(&self, id: &str) -> Option<ToolVertex> {
        self.state.read().tools.get(id).cloned()
    }

    /// Clone of a capability.
    pub fn capability(&self, id: &str) -> Option<Capability> {
        self.state.read().caps.get(id).cloned()
    }

    /// Resolved incidence set of a capability.
    pub fn incidence(&self, id: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        let cap = state
            .caps
            .get(id)
            .ok_or_else(|| HypergraphError::CapabilityNotFound(id.to_string()))?;
        Ok(cap.tools_used.iter().cloned().collect())
    }

    /// Child capability ids.
    pub fn children_of(&self, id: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        let cap = state
            .caps
            .get(id)
            .ok_or_else(|| HypergraphError::CapabilityNotFound(id.to_string()))?;
        Ok(cap.children.clone())
    }

    /// Parent capability ids.
    pub fn parents_of(&self, id: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        let cap = state
            .caps
            .get(id)
            .ok_or_else(|| HypergraphError::CapabilityNotFound(id.to_string()))?;
        Ok(cap.parents.iter().cloned().collect())
    }

    /// Capability ids at one composition level, sorted for determinism.
    pub fn caps_by_level(&self, level: usize) -> Vec<String> {
        let state = self.state.read();
        let mut ids: Vec<String> = state
            .caps
            .values()
            .filter(|cap| cap.level == level)
            .map(|cap| cap.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Out-neighbors of a node in the requested overlay.
    pub fn neighbors(&self, id: &str, kind: DependencyKind) -> Vec<String> {
        let state = self.state.read();
        let edges = match kind {
            DependencyKind::CapCap => &state.cap_edges,
            DependencyKind::ToolTool => &state.tool_edges,
        };
        edges
            .values()
            .filter(|edge| edge.from_id == id)
            .map(|edge| edge.to_id.clone())
            .collect()
    }

    /// Directed density of the tool-tool overlay:
    /// `|E_tool-tool| / (|V| · (|V| − 1))`.
    pub fn density(&self) -> f64 {
        let state = self.state.read();
        let v = state.tools.len();
        if v < 2 {
            return 0.0;
        }
        state.tool_edges.len() as f64 / (v as f64 * (v as f64 - 1.0))
    }

    /// `|V| + |E|`.
    pub fn graph_size(&self) -> usize {
        let state = self.state.read();
        state.tools.len() + state.caps.len()
    }

    /// Highest level with at least one capability.
    pub fn max_level_observed(&self) -> usize {
        let state = self.state.read();
        state.caps.values().map(|cap| cap.level).max().unwrap_or(0)
    }

    /// Weighted shortest path over the tool-tool overlay (hop cost
    /// `1 / weight`), used for DAG cycle breaking.
    #[instrument(name = "store.shortest_path", skip(self))]
    pub fn shortest_path_weighted(&self, from: &str, to: &str) -> Option<WeightedPath> {
        let state = self.state.read();
        shortest_path_weighted(&state.tool_edges, from, to)
    }

    /// Extracts a dense immutable snapshot for scoring and training.
    ///
    /// Tombstoned tools are excluded; capabilities are flattened in
    /// (level, id) order so indices are stable for a given graph content.
    #[instrument(name = "store.view", skip(self))]
    pub fn view(&self) -> GraphView {
        let state = self.state.read();

        let mut tool_ids: Vec<String> = state
            .tools
            .values()
            .filter(|tool| !tool.tombstoned)
            .map(|tool| tool.id.clone())
            .collect();
        tool_ids.sort();

        let tool_index: HashMap<&str, usize> = tool_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut tool_embeddings = Vec::with_capacity(tool_ids.len());
        let mut tool_success = Vec::with_capacity(tool_ids.len());
        for id in &tool_ids {
            let tool = &state.tools[id];
            tool_embeddings.push(tool.embedding.0.clone());
            tool_success.push(tool.success.rate() as f32);
        }

        // Flatten capabilities in (level, id) order.
        let mut ordered: BTreeMap<(usize, &str), &Capability> = BTreeMap::new();
        for cap in state.caps.values() {
            ordered.insert((cap.level, cap.id.as_str()), cap);
        }

        let mut cap_ids = Vec::with_capacity(ordered.len());
        let mut cap_levels = Vec::with_capacity(ordered.len());
        let mut cap_embeddings = Vec::with_capacity(ordered.len());
        let mut cap_success = Vec::with_capacity(ordered.len());
        for ((level, id), cap) in &ordered {
            cap_ids.push(id.to_string());
            cap_levels.push(*level);
            cap_embeddings.push(cap.embedding.0.clone());
            cap_success.push(cap.success.rate() as f32);
        }

        let cap_flat: HashMap<&str, usize> = cap_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut incidence = Vec::with_capacity(ordered.len());
        let mut children = Vec::with_capacity(ordered.len());
        for (_, cap) in &ordered {
            let mut tools: Vec<usize> = cap
                .tools_used
                .iter()
                .filter_map(|tool_id| tool_index.get(tool_id.as_str()).copied())
                .collect();
            tools.sort_unstable();
            tools.dedup();
            incidence.push(tools);

            let kids: Vec<usize> = cap
                .children
                .iter()
                .filter_map(|child_id| cap_flat.get(child_id.as_str()).copied())
                .collect();
            children.push(kids);
        }

        let mut cooccurrence: Vec<CooccurrenceEdge> = state
            .tool_edges
            .values()
            .filter_map(|edge| {
                let from = tool_index.get(edge.from_id.as_str())?;
                let to = tool_index.get(edge.to_id.as_str())?;
                Some(CooccurrenceEdge {
                    from: *from,
                    to: *to,
                    weight: edge.weight(),
                })
            })
            .collect();
        cooccurrence.sort_by_key(|edge| (edge.from, edge.to));

        GraphView::assemble(
            self.dim,
            tool_ids,
            tool_embeddings,
            tool_success,
            cap_ids,
            cap_levels,
            cap_embeddings,
            cap_success,
            incidence,
            children,
            cooccurrence,
        )
    }
}
