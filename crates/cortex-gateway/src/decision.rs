//! Decision logging port.
//!
//! The record deliberately keeps `signals` and `params` as loose JSON maps;
//! the telemetry adapter fills defaults so downstream consumers never see
//! absent fields. The core treats absent values as zero/false rather than
//! propagating optionality.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Search mode of a scoring request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    ActiveSearch,
    PassiveSuggestion,
    Speculation,
}

impl SearchMode {
    /// Mode-default fusion weight balancing semantic vs graph scores.
    pub fn default_alpha(&self) -> f32 {
        match self {
            SearchMode::ActiveSearch => 0.7,
            SearchMode::PassiveSuggestion => 0.5,
            SearchMode::Speculation => 0.85,
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SearchMode::ActiveSearch => "active_search",
            SearchMode::PassiveSuggestion => "passive_suggestion",
            SearchMode::Speculation => "speculation",
        };
        f.write_str(label)
    }
}

/// Accept/reject verdict of a thresholded decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
}

/// Structured decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub algorithm: String,
    pub mode: SearchMode,
    pub target_type: String,
    pub intent: String,
    pub final_score: f32,
    pub threshold: f32,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<Uuid>,
    /// Loose per-signal breakdown (semantic, graph, alpha, reliability, …).
    #[serde(default)]
    pub signals: serde_json::Value,
    /// Loose algorithm parameters snapshot.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DecisionRecord {
    /// Fills the defaults the adapters rely on: empty maps become objects,
    /// absent numerics read as zero.
    pub fn with_defaults(mut self) -> Self {
        if !self.signals.is_object() {
            self.signals = json!({});
        }
        if !self.params.is_object() {
            self.params = json!({});
        }
        self
    }
}

/// Port for structured decision records.
#[async_trait]
pub trait DecisionLogger: Send + Sync {
    async fn log_decision(&self, record: DecisionRecord);
}

/// Default no-op implementation for tests and minimal deployments.
pub struct NoopDecisionLogger;

#[async_trait]
impl DecisionLogger for NoopDecisionLogger {
    async fn log_decision(&self, _record: DecisionRecord) {}
}

/// Persistence half of the telemetry fan-out.
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn persist(&self, record: &DecisionRecord);
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct InMemoryDecisionSink {
    records: Mutex<Vec<DecisionRecord>>,
}

impl InMemoryDecisionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DecisionSink for InMemoryDecisionSink {
    async fn persist(&self, record: &DecisionRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Telemetry adapter: defaults the loose fields, persists the typed record,
/// and emits a tagged tracing span.
pub struct TelemetryDecisionLogger {
    sink: Arc<dyn DecisionSink>,
}

impl TelemetryDecisionLogger {
    pub fn new(sink: Arc<dyn DecisionSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl DecisionLogger for TelemetryDecisionLogger {
    async fn log_decision(&self, record: DecisionRecord) {
        let record = record.with_defaults();
        info!(
            algorithm = %record.algorithm,
            mode = %record.mode,
            final_score = record.final_score,
            threshold = record.threshold,
            decision = ?record.decision,
            target = record.target_id.as_deref().unwrap_or(""),
            "decision"
        );
        self.sink.persist(&record).await;
    }
}
