//! Trace ingestion: execution observations become graph structure and
//! replay experience.
//!
//! Tool vertices appear on first observation; consecutive executed-path
//! entries assert `sequence` co-occurrence edges as `inferred`, which the
//! store promotes to `observed` after three sightings.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use cortex_hypergraph::{DependencyKind, EdgeSource, EdgeType, EmbeddingProvider, HypergraphStore};
use cortex_replay::{Trace, TraceKind, TraceStore};

use crate::alpha::AlphaTable;
use crate::decision::SearchMode;
use crate::error::Result;

/// Outcome of one `observe_execution` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserveReport {
    pub appended: usize,
    pub rejected: usize,
    pub tools_created: usize,
    pub edges_asserted: usize,
}

/// Ingestion pipeline over injected handles.
pub struct TraceIngestor {
    graph: Arc<HypergraphStore>,
    traces: Arc<TraceStore>,
    provider: Arc<dyn EmbeddingProvider>,
    alpha: Arc<AlphaTable>,
}

impl TraceIngestor {
    pub fn new(
        graph: Arc<HypergraphStore>,
        traces: Arc<TraceStore>,
        provider: Arc<dyn EmbeddingProvider>,
        alpha: Arc<AlphaTable>,
    ) -> Self {
        Self {
            graph,
            traces,
            provider,
            alpha,
        }
    }

    /// Ensures a tool vertex exists, encoding its id on first sight.
    async fn ensure_tool(&self, id: &str, report: &mut ObserveReport) -> Result<()> {
        if self.graph.tool(id).is_some() {
            return Ok(());
        }
        let embedding = self.provider.encode(id).await?;
        self.graph.upsert_tool(id, embedding)?;
        report.tools_created += 1;
        Ok(())
    }

    /// Ingests one trace batch.
    ///
    /// Individual invalid traces are rejected with a warning; the batch as
    /// a whole still lands.
    #[instrument(name = "ingest.observe", skip_all, fields(batch = batch.len()))]
    pub async fn observe(&self, batch: Vec<Trace>) -> Result<ObserveReport> {
        let mut report = ObserveReport::default();

        for trace in batch {
            match trace.kind {
                TraceKind::ToolStart => {
                    self.ensure_tool(&trace.target_id, &mut report).await?;
                }
                TraceKind::ToolEnd => {
                    self.ensure_tool(&trace.target_id, &mut report).await?;
                    if let Some(outcome) = trace.outcome {
                        self.graph
                            .record_outcome(&trace.target_id, outcome.is_success())
                            .ok();
                    }
                }
                TraceKind::CapabilityStart => {}
                TraceKind::CapabilityEnd => {
                    for tool in &trace.executed_path {
                        self.ensure_tool(tool, &mut report).await?;
                    }
                    for pair in trace.executed_path.windows(2) {
                        if pair[0] == pair[1] {
                            continue;
                        }
                        match self.graph.add_edge(
                            DependencyKind::ToolTool,
                            &pair[0],
                            &pair[1],
                            EdgeType::Sequence,
                            EdgeSource::Inferred,
                        ) {
                            Ok(()) => report.edges_asserted += 1,
                            Err(err) => {
                                warn!(from = %pair[0], to = %pair[1], %err, "edge assertion failed")
                            }
                        }
                    }

                    if let (Some(capability), Some(outcome)) =
                        (trace.capability_id.as_deref(), trace.outcome)
                    {
                        self.graph
                            .record_outcome(capability, outcome.is_success())
                            .ok();
                        for mode in [
                            SearchMode::ActiveSearch,
                            SearchMode::PassiveSuggestion,
                            SearchMode::Speculation,
                        ] {
                            self.alpha
                                .record_outcome(capability, mode, outcome.is_success());
                        }
                    }
                }
            }

            match self.traces.append(trace) {
                Ok(()) => report.appended += 1,
                Err(err) => {
                    warn!(%err, "trace rejected");
                    report.rejected += 1;
                }
            }
        }

        debug!(
            appended = report.appended,
            rejected = report.rejected,
            tools = report.tools_created,
            edges = report.edges_asserted,
            "batch ingested"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_hypergraph::HashedMockProvider;
    use cortex_replay::Outcome;

    const DIM: usize = 8;

    fn ingestor() -> (TraceIngestor, Arc<HypergraphStore>, Arc<TraceStore>) {
        let graph = Arc::new(HypergraphStore::new(DIM, 2));
        let traces = Arc::new(TraceStore::with_seed(7, 5));
        let ingestor = TraceIngestor::new(
            graph.clone(),
            traces.clone(),
            Arc::new(HashedMockProvider::new(DIM)),
            Arc::new(AlphaTable::new()),
        );
        (ingestor, graph, traces)
    }

    fn executed(cap: &str, path: &[&str]) -> Vec<Trace> {
        vec![
            Trace::new(TraceKind::CapabilityStart, cap),
            Trace::new(TraceKind::CapabilityEnd, cap)
                .with_capability(cap)
                .with_intent("run it")
                .with_outcome(Outcome::Success, 3)
                .with_executed_path(path.iter().map(|t| t.to_string()).collect()),
        ]
    }

    #[tokio::test]
    async fn test_tools_created_on_first_observation() {
        let (ingestor, graph, traces) = ingestor();
        let report = ingestor
            .observe(executed("cap.a", &["t1", "t2"]))
            .await
            .unwrap();

        assert_eq!(report.appended, 2);
        assert_eq!(report.tools_created, 2);
        assert!(graph.tool("t1").is_some());
        assert_eq!(traces.len(), 2);
    }

    #[tokio::test]
    async fn test_sequence_edge_promoted_after_three_executions() {
        let (ingestor, graph, _) = ingestor();

        for round in 0..3 {
            ingestor
                .observe(executed(&format!("cap.{round}"), &["t1", "t2"]))
                .await
                .unwrap();
            let edge = graph.edge(DependencyKind::ToolTool, "t1", "t2").unwrap();
            if round < 2 {
                assert_eq!(edge.edge_source, EdgeSource::Inferred);
            } else {
                assert_eq!(edge.edge_source, EdgeSource::Observed);
                assert!((edge.weight() - 0.5).abs() < 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_traces_counted_not_fatal() {
        let (ingestor, _, _) = ingestor();
        // End without a start is rejected by the store.
        let batch = vec![Trace::new(TraceKind::CapabilityEnd, "cap.x").with_capability("cap.x")];
        let report = ingestor.observe(batch).await.unwrap();
        assert_eq!(report.appended, 0);
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn test_repeated_tool_in_path_is_skipped() {
        let (ingestor, graph, _) = ingestor();
        ingestor
            .observe(executed("cap.loop", &["t1", "t1", "t2"]))
            .await
            .unwrap();
        assert!(graph.edge(DependencyKind::ToolTool, "t1", "t1").is_none());
        assert!(graph.edge(DependencyKind::ToolTool, "t1", "t2").is_some());
    }
}
