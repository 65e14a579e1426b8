//! Unified search: semantic shortlist, one shared SHGAT forward, α-fusion,
//! reliability scaling, thresholded decision.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;

use cortex_hypergraph::{EmbeddingProvider, HypergraphStore, PermissionSet};
use cortex_shgat::{reliability_multiplier, score_candidates, ShgatModel};

use crate::alpha::AlphaTable;
use crate::decision::{Decision, DecisionLogger, DecisionRecord, SearchMode};
use crate::error::Result;
use crate::metrics::GatewayMetrics;

/// One unified-search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub intent: String,
    #[serde(default)]
    pub context_tools: Vec<String>,
    pub mode: SearchMode,
    pub top_k: usize,
    pub min_score: f32,
}

/// One ranked candidate as served to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub cap_id: String,
    pub semantic: f32,
    pub graph: f32,
    pub alpha: f32,
    pub reliability: f32,
    pub final_score: f32,
    pub threshold: f32,
    pub decision: Decision,
    pub correlation_id: Uuid,
}

/// Shortlist growth factor as a function of tool-graph density: sparse
/// graphs need less over-fetch before the graph signal reorders things.
fn expansion_multiplier(density: f64) -> f32 {
    if density < 0.01 {
        1.5
    } else if density < 0.10 {
        2.0
    } else {
        3.0
    }
}

/// Threshold margin by permission tier: riskier sandboxes demand more
/// confidence before acceptance.
fn risk_margin(permissions: PermissionSet) -> f32 {
    match permissions {
        PermissionSet::Minimal | PermissionSet::Readonly | PermissionSet::Trusted => 0.0,
        PermissionSet::McpStandard => 0.02,
        PermissionSet::Filesystem => 0.05,
        PermissionSet::NetworkApi => 0.08,
    }
}

fn context_hash(context_tools: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for tool in context_tools {
        tool.hash(&mut hasher);
    }
    hasher.finish()
}

/// Serving-path scorer over injected handles.
pub struct UnifiedScorer {
    graph: Arc<HypergraphStore>,
    model: Arc<ShgatModel>,
    provider: Arc<dyn EmbeddingProvider>,
    alpha: Arc<AlphaTable>,
    logger: Arc<dyn DecisionLogger>,
}

impl UnifiedScorer {
    pub fn new(
        graph: Arc<HypergraphStore>,
        model: Arc<ShgatModel>,
        provider: Arc<dyn EmbeddingProvider>,
        alpha: Arc<AlphaTable>,
        logger: Arc<dyn DecisionLogger>,
    ) -> Self {
        Self {
            graph,
            model,
            provider,
            alpha,
            logger,
        }
    }

    /// Serves one scoring query end to end.
    ///
    /// Deterministic given fixed parameters and frozen embeddings: the
    /// graph snapshot is taken once and the SHGAT forward is shared across
    /// all candidates.
    #[instrument(name = "scorer.unified_search", skip(self, request), fields(mode = %request.mode, top_k = request.top_k))]
    pub async fn unified_search(&self, request: &SearchRequest) -> Result<Vec<RankedCandidate>> {
        let started = Instant::now();
        let correlation_id = Uuid::new_v4();

        let intent_embedding = self.provider.encode(&request.intent).await?;
        let view = self.graph.view();
        if view.cap_ids.is_empty() {
            return Ok(Vec::new());
        }

        // Semantic shortlist over every capability.
        let mut semantic: Vec<(usize, f32)> = view
            .cap_embeddings
            .iter()
            .enumerate()
            .map(|(flat, embedding)| {
                let cap = cortex_hypergraph::Embedding::new_unchecked(embedding.clone());
                (flat, intent_embedding.cosine(&cap))
            })
            .collect();
        semantic.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| view.cap_ids[a.0].cmp(&view.cap_ids[b.0]))
        });

        let density = self.graph.density();
        let shortlist_len = ((request.top_k.max(1) as f32) * expansion_multiplier(density))
            .ceil() as usize;
        semantic.truncate(shortlist_len.min(view.cap_ids.len()));
        debug!(
            shortlist = semantic.len(),
            density,
            "semantic shortlist built"
        );

        // One shared forward pass; graph score per shortlisted candidate.
        let candidates: Vec<usize> = semantic.iter().map(|(flat, _)| *flat).collect();
        let graph_scores = self
            .model
            .score(&view, &intent_embedding, &candidates)?;

        let ctx_hash = context_hash(&request.context_tools);
        let mut ranked: Vec<RankedCandidate> = Vec::with_capacity(candidates.len());
        for ((flat, semantic_score), scored) in semantic.iter().zip(graph_scores.iter()) {
            let cap_id = view.cap_ids[*flat].clone();
            let alpha = self.alpha.alpha_for(&cap_id, request.mode);
            let reliability = reliability_multiplier(view.cap_success[*flat]);
            let fused = alpha * semantic_score + (1.0 - alpha) * scored.score;
            let final_score = fused * reliability;

            let permissions = self
                .graph
                .capability(&cap_id)
                .map(|cap| cap.permissions)
                .unwrap_or_default();
            let threshold = request.min_score + risk_margin(permissions);

            let decision = if final_score >= threshold {
                Decision::Accepted
            } else {
                Decision::Rejected
            };

            ranked.push(RankedCandidate {
                cap_id,
                semantic: *semantic_score,
                graph: scored.score,
                alpha,
                reliability,
                final_score,
                threshold,
                decision,
                correlation_id,
            });
        }

        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cap_id.cmp(&b.cap_id))
        });
        ranked.truncate(request.top_k.max(1));

        for candidate in &ranked {
            GatewayMetrics::inc_served();
            if candidate.decision == Decision::Rejected {
                GatewayMetrics::inc_rejected();
            }
            self.logger
                .log_decision(DecisionRecord {
                    algorithm: "shgat-unified".into(),
                    mode: request.mode,
                    target_type: "capability".into(),
                    intent: request.intent.clone(),
                    final_score: candidate.final_score,
                    threshold: candidate.threshold,
                    decision: candidate.decision,
                    target_id: Some(candidate.cap_id.clone()),
                    correlation_id: Some(correlation_id),
                    signals: json!({
                        "semantic": candidate.semantic,
                        "graph": candidate.graph,
                        "alpha": candidate.alpha,
                        "reliability": candidate.reliability,
                        "contextHash": format!("{ctx_hash:016x}"),
                    }),
                    params: json!({
                        "density": density,
                        "expansionMultiplier": expansion_multiplier(density),
                    }),
                })
                .await;
        }

        GatewayMetrics::observe_scoring_duration(started.elapsed().as_secs_f64());
        Ok(ranked)
    }
}
