//! Cortex gateway core: the unified scoring pipeline over the learned
//! hypergraph, trace-driven learning, and the administrative parameter
//! surface.
//!
//! Everything stateful is a scoped handle created at bootstrap and
//! injected; the crate holds no module-level mutable state.

pub mod alpha;
pub mod decision;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod params_store;
pub mod scorer;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use cortex_config::RuntimeConfig;
use cortex_hypergraph::{EmbeddingProvider, HypergraphStore};
use cortex_replay::{PerTrainer, Trace, TraceStore, TrainOutcome};
use cortex_shgat::{ShgatModel, PARAM_SCHEMA_VERSION};

pub use alpha::AlphaTable;
pub use decision::{
    Decision, DecisionLogger, DecisionRecord, DecisionSink, InMemoryDecisionSink,
    NoopDecisionLogger, SearchMode, TelemetryDecisionLogger,
};
pub use error::{GatewayError, Result};
pub use ingest::{ObserveReport, TraceIngestor};
pub use metrics::GatewayMetrics;
pub use params_store::{InMemoryParamStore, ParamRecord, ParamStore};
pub use scorer::{RankedCandidate, SearchRequest, UnifiedScorer};

/// Decision taken by the startup training gate.
#[derive(Debug, Clone, PartialEq)]
pub enum StartupTraining {
    /// Persisted parameters were fresh enough; batch training skipped.
    SkippedFresh { age_seconds: u64 },
    /// Batch training ran and the refreshed parameters were persisted.
    Trained { trained_traces: usize },
    /// Nothing to train on.
    NoTraces,
    /// A concurrent round already held the slot.
    Dropped,
}

/// Gateway facade wiring every core component as injected handles.
pub struct Gateway {
    config: RuntimeConfig,
    graph: Arc<HypergraphStore>,
    model: Arc<ShgatModel>,
    traces: Arc<TraceStore>,
    trainer: Arc<PerTrainer>,
    scorer: UnifiedScorer,
    ingestor: TraceIngestor,
    params_store: Arc<dyn ParamStore>,
    user_id: String,
    live_training: bool,
}

impl Gateway {
    /// Wires the gateway.
    ///
    /// Hard-fails with [`GatewayError::EmbeddingDimMismatch`] when provider
    /// and configuration disagree on the embedding dimension.
    pub fn bootstrap(
        config: RuntimeConfig,
        provider: Arc<dyn EmbeddingProvider>,
        logger: Arc<dyn DecisionLogger>,
        params_store: Arc<dyn ParamStore>,
        kernel_bin: PathBuf,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        if provider.dimension() != config.embedding_dim {
            return Err(GatewayError::EmbeddingDimMismatch {
                config: config.embedding_dim,
                provider: provider.dimension(),
            });
        }

        let graph = Arc::new(HypergraphStore::new(config.embedding_dim, config.max_level));
        let model = Arc::new(ShgatModel::with_adaptive(
            config.embedding_dim,
            config.max_level,
            graph.graph_size(),
            0xC0E7,
        ));
        let traces = Arc::new(TraceStore::new(config.trace_retention_days));
        let alpha = Arc::new(AlphaTable::new());

        let trainer = Arc::new(PerTrainer::new(
            traces.clone(),
            graph.clone(),
            model.clone(),
            provider.clone(),
            config.clone(),
            kernel_bin,
        ));
        let scorer = UnifiedScorer::new(
            graph.clone(),
            model.clone(),
            provider.clone(),
            alpha.clone(),
            logger,
        );
        let ingestor = TraceIngestor::new(graph.clone(), traces.clone(), provider, alpha);

        Ok(Self {
            config,
            graph,
            model,
            traces,
            trainer,
            scorer,
            ingestor,
            params_store,
            user_id: user_id.into(),
            live_training: true,
        })
    }

    /// Disables the asynchronous live-training tick (tests, replays).
    pub fn without_live_training(mut self) -> Self {
        self.live_training = false;
        self
    }

    /// Hypergraph handle (administration, seeding).
    pub fn graph(&self) -> &Arc<HypergraphStore> {
        &self.graph
    }

    /// Trace store handle.
    pub fn traces(&self) -> &Arc<TraceStore> {
        &self.traces
    }

    /// Model handle.
    pub fn model(&self) -> &Arc<ShgatModel> {
        &self.model
    }

    /// Startup training gate: loads persisted parameters, and skips batch
    /// training entirely when they are fresher than the staleness budget.
    #[instrument(name = "gateway.startup_training", skip(self))]
    pub async fn startup_training(&self) -> Result<StartupTraining> {
        let now = Utc::now();
        if let Some(record) = self.params_store.load(&self.user_id).await? {
            match self.model.import_params(record.params_json.clone()) {
                Ok(()) => {
                    let age = record.age_seconds(now);
                    if age <= self.config.param_staleness_sec {
                        info!(
                            age_seconds = age,
                            budget = self.config.param_staleness_sec,
                            "persisted params are fresh, skipping batch training"
                        );
                        return Ok(StartupTraining::SkippedFresh { age_seconds: age });
                    }
                }
                Err(err) => {
                    warn!(%err, "persisted params rejected, keeping in-memory set");
                }
            }
        }

        match self.trainer.train_batch().await {
            Ok(TrainOutcome::Completed(report)) => {
                GatewayMetrics::inc_training_round();
                self.persist_params().await?;
                Ok(StartupTraining::Trained {
                    trained_traces: report.trained_traces,
                })
            }
            Ok(TrainOutcome::NoTraces) => Ok(StartupTraining::NoTraces),
            Ok(TrainOutcome::Dropped) => Ok(StartupTraining::Dropped),
            Err(err) => {
                GatewayMetrics::inc_training_failure();
                Err(err.into())
            }
        }
    }

    /// Serves one unified-search query.
    pub async fn unified_search(&self, request: &SearchRequest) -> Result<Vec<RankedCandidate>> {
        self.scorer.unified_search(request).await
    }

    /// Ingests an executed trace batch; may asynchronously trigger a live
    /// training round (dropped if one is already in flight).
    #[instrument(name = "gateway.observe_execution", skip_all)]
    pub async fn observe_execution(&self, batch: Vec<Trace>) -> Result<ObserveReport> {
        let trainable = batch.iter().any(Trace::is_trainable);
        let report = self.ingestor.observe(batch).await?;

        // Keep the model geometry in step with graph growth; the level
        // capacity never shrinks below the configured maximum.
        let max_level = self.config.max_level.max(self.graph.max_level_observed());
        self.model
            .ensure_geometry(self.graph.graph_size(), max_level, 0xC0E7);

        if self.live_training && trainable {
            let trainer = self.trainer.clone();
            let model = self.model.clone();
            let params_store = self.params_store.clone();
            let user_id = self.user_id.clone();
            tokio::spawn(async move {
                match trainer.train_live().await {
                    Ok(TrainOutcome::Completed(report)) => {
                        GatewayMetrics::inc_training_round();
                        if let Ok(blob) = model.export_params() {
                            let record = ParamRecord {
                                params_json: blob,
                                updated_at: Utc::now(),
                                schema_version: PARAM_SCHEMA_VERSION,
                            };
                            if let Err(err) = params_store.save(&user_id, record).await {
                                warn!(%err, "failed to persist trained params");
                            }
                        }
                        info!(traces = report.trained_traces, "live training round done");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        GatewayMetrics::inc_training_failure();
                        warn!(%err, "live training failed, will retry next tick");
                    }
                }
            });
        }
        Ok(report)
    }

    /// Drops traces older than the retention window.
    pub fn retention_sweep(&self) -> usize {
        self.traces.retention_sweep(Utc::now())
    }

    /// Administrative parameter export.
    pub fn export_params(&self) -> Result<serde_json::Value> {
        Ok(self.model.export_params()?)
    }

    /// Administrative parameter import; persists on success.
    pub async fn import_params(&self, blob: serde_json::Value) -> Result<()> {
        self.model.import_params(blob)?;
        self.persist_params().await
    }

    async fn persist_params(&self) -> Result<()> {
        let record = ParamRecord {
            params_json: self.model.export_params()?,
            updated_at: Utc::now(),
            schema_version: PARAM_SCHEMA_VERSION,
        };
        self.params_store.save(&self.user_id, record).await
    }
}
