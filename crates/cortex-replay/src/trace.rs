//! Episodic trace records.
//!
//! Traces form a hierarchical call tree via `parent_trace_id` and carry the
//! signal the trainer learns from: the intent text, the executed tool path,
//! and the capability that served it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle event class of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    ToolStart,
    ToolEnd,
    CapabilityStart,
    CapabilityEnd,
}

impl TraceKind {
    /// Whether this kind opens a span that a matching end must close.
    pub fn is_start(&self) -> bool {
        matches!(self, TraceKind::ToolStart | TraceKind::CapabilityStart)
    }
}

/// Execution outcome of a completed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fail,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Priority a fresh trace enters the replay index with: maximal, so new
/// experience is sampled at least once before TD feedback takes over.
pub const INITIAL_PRIORITY: f32 = 1.0;

/// One episodic trace record, the unit of prioritized replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_trace_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub kind: TraceKind,
    /// Tool or capability the event refers to.
    pub target_id: String,
    /// Stable hash of the invocation arguments.
    #[serde(default)]
    pub args_hash: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
    /// Natural-language intent that led to this execution.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub intent_text: Option<String>,
    /// Ordered tool ids actually executed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executed_path: Vec<String>,
    /// The capability that served the intent (the contrastive positive).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub capability_id: Option<String>,
    /// Replay priority `|td|^α`, clamped to [1e−6, 1].
    #[serde(default = "default_priority")]
    pub priority: f32,
}

fn default_priority() -> f32 {
    INITIAL_PRIORITY
}

impl Trace {
    /// New trace with a fresh id and maximal initial priority.
    pub fn new(kind: TraceKind, target_id: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            parent_trace_id: None,
            timestamp: Utc::now(),
            kind,
            target_id: target_id.into(),
            args_hash: 0,
            outcome: None,
            duration_ms: None,
            intent_text: None,
            executed_path: Vec::new(),
            capability_id: None,
            priority: INITIAL_PRIORITY,
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_trace_id = Some(parent);
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome, duration_ms: u64) -> Self {
        self.outcome = Some(outcome);
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent_text = Some(intent.into());
        self
    }

    pub fn with_executed_path(mut self, path: Vec<String>) -> Self {
        self.executed_path = path;
        self
    }

    pub fn with_capability(mut self, capability_id: impl Into<String>) -> Self {
        self.capability_id = Some(capability_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the trace can seed a contrastive training example.
    pub fn is_trainable(&self) -> bool {
        self.kind == TraceKind::CapabilityEnd
            && self.capability_id.is_some()
            && self.intent_text.is_some()
    }
}
