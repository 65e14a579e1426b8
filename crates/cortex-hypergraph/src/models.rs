//! Domain models for the tool/capability hypergraph: vertices, hyperedges,
//! and the dependency-edge overlays used for co-occurrence and pathing.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Embedding;

/// Structured validation errors describing specific failure causes.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Identifiers cannot be empty.
    #[error("Identifier cannot be empty")]
    EmptyId,

    /// Dependency edges cannot connect a node to itself.
    #[error("Self-loop rejected on node: {0}")]
    SelfLoop(String),

    /// Embedding dimensionality disagrees with the store dimension.
    #[error("Invalid embedding dimension: expected {expected}, got {got}")]
    InvalidEmbeddingDimension { expected: usize, got: usize },

    /// Composite capabilities must name at least one child.
    #[error("Capability at level {level} requires children")]
    MissingChildren { level: usize },

    /// Atomic capabilities must bundle at least one tool invocation.
    #[error("Level-0 capability requires tool invocations")]
    EmptyInvocations,

    /// Composition level exceeds the configured maximum.
    #[error("Capability level {got} exceeds maximum {max}")]
    LevelOutOfRange { got: usize, max: usize },

    /// A composite capability referenced an unknown child.
    #[error("Unknown child capability: {0}")]
    UnknownChild(String),
}

/// Permission tier granted to a capability's execution sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionSet {
    #[default]
    Minimal,
    Readonly,
    Filesystem,
    NetworkApi,
    McpStandard,
    Trusted,
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PermissionSet::Minimal => "minimal",
            PermissionSet::Readonly => "readonly",
            PermissionSet::Filesystem => "filesystem",
            PermissionSet::NetworkApi => "network-api",
            PermissionSet::McpStandard => "mcp-standard",
            PermissionSet::Trusted => "trusted",
        };
        f.write_str(label)
    }
}

/// Relationship class of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Contains,
    Sequence,
    Alternative,
    Dependency,
}

impl EdgeType {
    /// Base weight contribution of the relationship class.
    pub fn weight(&self) -> f32 {
        match self {
            EdgeType::Dependency => 1.0,
            EdgeType::Contains => 0.8,
            EdgeType::Alternative => 0.6,
            EdgeType::Sequence => 0.5,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EdgeType::Contains => "contains",
            EdgeType::Sequence => "sequence",
            EdgeType::Alternative => "alternative",
            EdgeType::Dependency => "dependency",
        };
        f.write_str(label)
    }
}

/// Provenance of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    Observed,
    Inferred,
    Template,
}

impl EdgeSource {
    /// Weight modifier applied on top of [`EdgeType::weight`].
    pub fn modifier(&self) -> f32 {
        match self {
            EdgeSource::Observed => 1.0,
            EdgeSource::Inferred => 0.7,
            EdgeSource::Template => 0.5,
        }
    }
}

impl fmt::Display for EdgeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EdgeSource::Observed => "observed",
            EdgeSource::Inferred => "inferred",
            EdgeSource::Template => "template",
        };
        f.write_str(label)
    }
}

/// Which overlay a dependency edge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Capability → capability composition/ordering overlay.
    CapCap,
    /// Tool → tool co-occurrence overlay.
    ToolTool,
}

/// Beta-count success accumulator.
///
/// Starts at (1, 1) so an unobserved entity reads as a 0.5 success rate
/// instead of dividing by zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessCounter {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for SuccessCounter {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }
}

impl SuccessCounter {
    /// Records one execution outcome.
    pub fn record(&mut self, success: bool) {
        if success {
            self.alpha += 1.0;
        } else {
            self.beta += 1.0;
        }
    }

    /// Posterior mean success rate.
    pub fn rate(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Number of recorded outcomes (excluding the prior).
    pub fn observations(&self) -> u64 {
        (self.alpha + self.beta - 2.0).max(0.0) as u64
    }
}

/// Tool vertex of the bipartite hypergraph.
///
/// Created on first observation and never deleted; retirement is expressed
/// by tombstoning so historical traces keep resolving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolVertex {
    /// Stable tool identifier (MCP tool name).
    pub id: String,
    /// Frozen embedding of the tool description.
    pub embedding: Embedding,
    /// Beta-count execution outcome accumulator.
    #[serde(default)]
    pub success: SuccessCounter,
    /// Timestamp of the most recent invocation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_used: Option<DateTime<Utc>>,
    /// Logical deletion marker.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tombstoned: bool,
}

impl ToolVertex {
    pub fn new(id: impl Into<String>, embedding: Embedding) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        Ok(Self {
            id,
            embedding,
            success: SuccessCounter::default(),
            last_used: None,
            tombstoned: false,
        })
    }
}

/// Capability hyperedge over tool vertices.
///
/// Level-0 capabilities bundle concrete tool invocations; level-k≥1
/// capabilities compose level-(k−1) children, and their incidence set is the
/// union of their children's incidence sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Stable capability identifier.
    pub id: String,
    /// Composition level, 0-based.
    pub level: usize,
    /// Frozen embedding derived from the capability description.
    pub embedding: Embedding,
    /// Ordered tool invocation sequence; repeats allowed.
    pub tool_invocations: Vec<String>,
    /// Deduplicated incidence set over tool ids.
    pub tools_used: BTreeSet<String>,
    /// Child capability ids (empty at level 0).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// Parent capability ids, maintained by the store.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub parents: BTreeSet<String>,
    /// Beta-count execution outcome accumulator.
    #[serde(default)]
    pub success: SuccessCounter,
    /// Sandbox permission tier.
    #[serde(default)]
    pub permissions: PermissionSet,
}

impl Capability {
    /// Builds an atomic (level-0) capability from its invocation bundle.
    pub fn atomic(
        id: impl Into<String>,
        embedding: Embedding,
        tool_invocations: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if tool_invocations.is_empty() {
            return Err(ValidationError::EmptyInvocations);
        }
        let tools_used = tool_invocations.iter().cloned().collect();
        Ok(Self {
            id,
            level: 0,
            embedding,
            tool_invocations,
            tools_used,
            children: Vec::new(),
            parents: BTreeSet::new(),
            success: SuccessCounter::default(),
            permissions: PermissionSet::default(),
        })
    }

    /// Builds a composite (level-k≥1) capability; the incidence set is filled
    /// in by the store from the children's incidence union.
    pub fn composite(
        id: impl Into<String>,
        level: usize,
        embedding: Embedding,
        children: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if children.is_empty() {
            return Err(ValidationError::MissingChildren { level });
        }
        Ok(Self {
            id,
            level,
            embedding,
            tool_invocations: Vec::new(),
            tools_used: BTreeSet::new(),
            children,
            parents: BTreeSet::new(),
            success: SuccessCounter::default(),
            permissions: PermissionSet::default(),
        })
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }
}

/// Weighted dependency edge in either the cap-cap or tool-tool overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from_id: String,
    pub to_id: String,
    pub edge_type: EdgeType,
    pub edge_source: EdgeSource,
    /// Times this edge has been asserted; drives inferred→observed promotion.
    pub observed_count: u32,
    /// Confidence in [0, 1], saturating with repeated observation.
    pub confidence_score: f32,
    pub last_observed: DateTime<Utc>,
}

impl DependencyEdge {
    /// Observation count at which an inferred edge is promoted to observed.
    pub const PROMOTION_THRESHOLD: u32 = 3;

    pub fn new(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        edge_type: EdgeType,
        edge_source: EdgeSource,
    ) -> Result<Self, ValidationError> {
        let from_id = from_id.into();
        let to_id = to_id.into();
        if from_id.trim().is_empty() || to_id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if from_id == to_id {
            return Err(ValidationError::SelfLoop(from_id));
        }
        Ok(Self {
            from_id,
            to_id,
            edge_type,
            edge_source,
            observed_count: 1,
            confidence_score: edge_source.modifier().min(1.0),
            last_observed: Utc::now(),
        })
    }

    /// Effective weight: type weight × source modifier.
    pub fn weight(&self) -> f32 {
        self.edge_type.weight() * self.edge_source.modifier()
    }

    /// Registers one more assertion of this edge, promoting inferred edges to
    /// observed once [`Self::PROMOTION_THRESHOLD`] is reached. Promotion is
    /// sticky: an observed edge never downgrades.
    pub fn reinforce(&mut self, source: EdgeSource) {
        self.observed_count += 1;
        self.last_observed = Utc::now();

        if source == EdgeSource::Observed {
            self.edge_source = EdgeSource::Observed;
        } else if self.edge_source != EdgeSource::Observed
            && self.observed_count >= Self::PROMOTION_THRESHOLD
        {
            self.edge_source = EdgeSource::Observed;
        }

        // Saturating confidence ramp toward 1.0.
        self.confidence_score = (self.confidence_score + 0.1).min(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding() -> Embedding {
        Embedding::from(vec![0.5; 8])
    }

    #[test]
    fn test_tool_vertex_rejects_empty_id() {
        assert!(matches!(
            ToolVertex::new("  ", embedding()),
            Err(ValidationError::EmptyId)
        ));
    }

    #[test]
    fn test_atomic_capability_builds_incidence() {
        let cap = Capability::atomic(
            "c1",
            embedding(),
            vec!["read".into(), "parse".into(), "read".into()],
        )
        .unwrap();
        assert_eq!(cap.level, 0);
        assert_eq!(cap.tool_invocations.len(), 3);
        assert_eq!(cap.tools_used.len(), 2);
    }

    #[test]
    fn test_composite_requires_children() {
        let result = Capability::composite("c2", 1, embedding(), Vec::new());
        assert!(matches!(
            result,
            Err(ValidationError::MissingChildren { level: 1 })
        ));
    }

    #[test]
    fn test_edge_weight_algebra() {
        let edge =
            DependencyEdge::new("t1", "t2", EdgeType::Sequence, EdgeSource::Observed).unwrap();
        assert!((edge.weight() - 0.5).abs() < 1e-6);

        let edge =
            DependencyEdge::new("t1", "t2", EdgeType::Dependency, EdgeSource::Inferred).unwrap();
        assert!((edge.weight() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_edge_rejects_self_loop() {
        let result = DependencyEdge::new("t1", "t1", EdgeType::Sequence, EdgeSource::Observed);
        assert!(matches!(result, Err(ValidationError::SelfLoop(_))));
    }

    #[test]
    fn test_inferred_edge_promotes_after_three_assertions() {
        let mut edge =
            DependencyEdge::new("t1", "t2", EdgeType::Sequence, EdgeSource::Inferred).unwrap();
        let inferred_weight = edge.weight();
        assert_eq!(edge.edge_source, EdgeSource::Inferred);

        edge.reinforce(EdgeSource::Inferred);
        assert_eq!(edge.edge_source, EdgeSource::Inferred);

        edge.reinforce(EdgeSource::Inferred);
        assert_eq!(edge.edge_source, EdgeSource::Observed);
        assert_eq!(edge.observed_count, 3);
        assert!(edge.weight() > inferred_weight);

        // Promotion is sticky.
        edge.reinforce(EdgeSource::Template);
        assert_eq!(edge.edge_source, EdgeSource::Observed);
    }

    #[test]
    fn test_success_counter_rate() {
        let mut counter = SuccessCounter::default();
        assert!((counter.rate() - 0.5).abs() < 1e-9);

        counter.record(true);
        counter.record(true);
        counter.record(false);
        assert_eq!(counter.observations(), 3);
        assert!((counter.rate() - 3.0 / 5.0).abs() < 1e-9);
    }
}
