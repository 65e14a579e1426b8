//! K-head attention scorer and contrastive training.
//!
//! Scoring computes `ℓ_h = (W_q·ĩ)·(W_k·ẽ_c)/√scoringDim` per head and fuses
//! by mean; the sigmoid of the fused logit is the public score, while raw
//! logits feed InfoNCE. Parameters live behind an `ArcSwap`, so in-flight
//! scorers always observe one coherent set.

use std::sync::Arc;

use arc_swap::ArcSwap;
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use tracing::{debug, info, instrument};

use cortex_hypergraph::view::GraphView;

use crate::adaptive::adaptive_heads_by_graph_size;
use crate::error::{Result, ShgatError};
use crate::linalg::{fisher_yates, matvec, outer, sigmoid, softmax};
use crate::orchestrator::{MultiLevelOrchestrator, Propagated};
use crate::params::{ShgatGrads, ShgatParams};

/// L2 ceiling applied to every optimizer step.
pub const GRAD_CLIP_NORM: f32 = 5.0;

const LOG_EPS: f32 = 1e-9;

/// One contrastive training example over a candidate embedding matrix.
#[derive(Debug, Clone)]
pub struct ContrastiveExample {
    pub intent: Vec<f32>,
    /// Row index of the positive candidate.
    pub positive: usize,
    /// Row indices of the sampled negatives.
    pub negatives: Vec<usize>,
}

/// One binary example for the bootstrap BCE fallback.
#[derive(Debug, Clone)]
pub struct BinaryExample {
    pub intent: Vec<f32>,
    pub candidate: usize,
    /// 1.0 for success, 0.0 for failure.
    pub target: f32,
}

/// Scored candidate as served to the fusion layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredCandidate {
    pub flat: usize,
    pub logit: f32,
    /// `σ(logit)`, the ranking score.
    pub score: f32,
}

/// Aggregate statistics of one optimizer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainStats {
    pub mean_loss: f32,
    pub accuracy: f32,
    pub grad_norm: f32,
}

/// Hyperparameters of one training call.
#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    pub learning_rate: f32,
    pub tau: f32,
    pub batch_size: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            tau: 0.1,
            batch_size: 16,
        }
    }
}

/// Post-hoc reliability multiplier by success-rate band.
pub fn reliability_multiplier(success_rate: f32) -> f32 {
    if success_rate < 0.5 {
        0.1
    } else if success_rate > 0.9 {
        1.2
    } else {
        1.0
    }
}

/// Samples `n` distinct negatives from `0..universe`, excluding `positive`,
/// by Fisher–Yates shuffle of the remaining candidates.
pub fn sample_negatives(
    universe: usize,
    positive: usize,
    n: usize,
    rng: &mut impl Rng,
) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..universe).filter(|c| *c != positive).collect();
    fisher_yates(&mut pool, rng);
    pool.truncate(n);
    pool
}

/// Projects an intent embedding: `ĩ = W_intent · i`.
pub fn project_intent(params: &ShgatParams, intent: &[f32]) -> Result<Array1<f32>> {
    if intent.len() != params.embedding_dim {
        return Err(ShgatError::InvalidDimension {
            expected: params.embedding_dim,
            got: intent.len(),
        });
    }
    let i = ndarray::ArrayView1::from(intent);
    Ok(matvec(params.w_intent.view(), i))
}

/// Mean-over-heads raw logit for one (projected intent, candidate) pair.
fn fused_logit(params: &ShgatParams, i_tilde: &Array1<f32>, candidate: ndarray::ArrayView1<'_, f32>) -> f32 {
    let scale = 1.0 / (params.plan.scoring_dim as f32).sqrt();
    let mut total = 0.0f32;
    for head in &params.heads {
        let q = matvec(head.w_q.view(), i_tilde.view());
        let k = matvec(head.w_k.view(), candidate);
        total += q.dot(&k) * scale;
    }
    total / params.heads.len() as f32
}

/// Scores a set of candidates against one intent over the given embedding
/// rows.
pub fn score_candidates(
    params: &ShgatParams,
    embeddings: ArrayView2<'_, f32>,
    intent: &[f32],
    candidates: &[usize],
) -> Result<Vec<ScoredCandidate>> {
    let i_tilde = project_intent(params, intent)?;
    candidates
        .iter()
        .map(|flat| {
            if *flat >= embeddings.nrows() {
                return Err(ShgatError::CandidateOutOfRange {
                    index: *flat,
                    len: embeddings.nrows(),
                });
            }
            let logit = fused_logit(params, &i_tilde, embeddings.row(*flat));
            Ok(ScoredCandidate {
                flat: *flat,
                logit,
                score: sigmoid(logit),
            })
        })
        .collect()
}

/// Result of one contrastive forward/backward over a batch.
pub struct ContrastiveBackward {
    pub loss: f32,
    pub accuracy: f32,
    /// Head-side gradients (`W_q`, `W_k`, `W_intent`); level and V→V blocks
    /// stay zero and are filled by the orchestrator backward.
    pub grads: ShgatGrads,
    /// Gradient on the candidate embedding rows, to be routed through
    /// `backward_multi_level`.
    pub d_embeddings: Array2<f32>,
    /// `|σ(ℓ_pos) − 1|` per example, in input order.
    pub td_errors: Vec<f32>,
}

/// InfoNCE forward/backward on raw logits.
///
/// `softmax_τ(ℓ_pos, ℓ_neg…)` with loss `−log softmax[0]`; the analytic
/// gradients are `dℓ_pos = (s_pos − 1)/τ` and `dℓ_neg = s_neg/τ`.
#[instrument(name = "shgat.info_nce", skip_all, fields(examples = examples.len()))]
pub fn info_nce_backward(
    params: &ShgatParams,
    embeddings: ArrayView2<'_, f32>,
    examples: &[ContrastiveExample],
    tau: f32,
) -> Result<ContrastiveBackward> {
    if examples.is_empty() {
        return Err(ShgatError::InvalidBatch("empty contrastive batch".into()));
    }

    let num_heads = params.heads.len();
    let scale = 1.0 / (params.plan.scoring_dim as f32).sqrt();
    let head_mean = 1.0 / num_heads as f32;

    let mut grads = ShgatGrads::zeros_like(params);
    let mut d_embeddings = Array2::<f32>::zeros(embeddings.dim());
    let mut loss = 0.0f32;
    let mut hits = 0usize;
    let mut td_errors = Vec::with_capacity(examples.len());

    for example in examples {
        let candidates: Vec<usize> = std::iter::once(example.positive)
            .chain(example.negatives.iter().copied())
            .collect();
        for flat in &candidates {
            if *flat >= embeddings.nrows() {
                return Err(ShgatError::CandidateOutOfRange {
                    index: *flat,
                    len: embeddings.nrows(),
                });
            }
        }

        let i_tilde = project_intent(params, &example.intent)?;

        // Cache per-head projections for the backward rank-one updates.
        let q_heads: Vec<Array1<f32>> = params
            .heads
            .iter()
            .map(|head| matvec(head.w_q.view(), i_tilde.view()))
            .collect();
        let k_heads: Vec<Vec<Array1<f32>>> = candidates
            .iter()
            .map(|flat| {
                params
                    .heads
                    .iter()
                    .map(|head| matvec(head.w_k.view(), embeddings.row(*flat)))
                    .collect()
            })
            .collect();

        let logits: Vec<f32> = k_heads
            .iter()
            .map(|ks| {
                let mut total = 0.0f32;
                for h in 0..num_heads {
                    total += q_heads[h].dot(&ks[h]) * scale;
                }
                total * head_mean
            })
            .collect();

        let scaled: Vec<f32> = logits.iter().map(|l| l / tau).collect();
        let probs = softmax(&scaled);
        loss -= (probs[0] + LOG_EPS).ln();
        let best = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        if best == 0 {
            hits += 1;
        }
        td_errors.push((sigmoid(logits[0]) - 1.0).abs());

        let mut d_i_tilde = Array1::<f32>::zeros(i_tilde.len());
        for (slot, flat) in candidates.iter().enumerate() {
            let d_logit = if slot == 0 {
                (probs[0] - 1.0) / tau
            } else {
                probs[slot] / tau
            };
            if d_logit == 0.0 {
                continue;
            }
            let coef = d_logit * scale * head_mean;
            let candidate_row = embeddings.row(*flat);

            for h in 0..num_heads {
                let k = &k_heads[slot][h];
                let q = &q_heads[h];

                grads.w_q[h].scaled_add(coef, &outer(k.view(), i_tilde.view()));
                grads.w_k[h].scaled_add(coef, &outer(q.view(), candidate_row));

                // dĩ += W_qᵀ (coef·k); dẽ += W_kᵀ (coef·q).
                let dq = matvec(params.heads[h].w_q.t(), k.view());
                d_i_tilde.scaled_add(coef, &dq);
                let dk = matvec(params.heads[h].w_k.t(), q.view());
                for c in 0..dk.len() {
                    d_embeddings[[*flat, c]] += coef * dk[c];
                }
            }
        }

        let i = ndarray::ArrayView1::from(example.intent.as_slice());
        grads.w_intent += &outer(d_i_tilde.view(), i);
    }

    Ok(ContrastiveBackward {
        loss: loss / examples.len() as f32,
        accuracy: hits as f32 / examples.len() as f32,
        grads,
        d_embeddings,
        td_errors,
    })
}

/// Bootstrap BCE fallback when no negatives exist. Uses sigmoid scores and
/// the standard derivative `dℓ = σ(ℓ) − y`.
pub fn bce_backward(
    params: &ShgatParams,
    embeddings: ArrayView2<'_, f32>,
    examples: &[BinaryExample],
) -> Result<ContrastiveBackward> {
    if examples.is_empty() {
        return Err(ShgatError::InvalidBatch("empty bce batch".into()));
    }

    let num_heads = params.heads.len();
    let scale = 1.0 / (params.plan.scoring_dim as f32).sqrt();
    let head_mean = 1.0 / num_heads as f32;

    let mut grads = ShgatGrads::zeros_like(params);
    let mut d_embeddings = Array2::<f32>::zeros(embeddings.dim());
    let mut loss = 0.0f32;
    let mut hits = 0usize;
    let mut td_errors = Vec::with_capacity(examples.len());

    for example in examples {
        if example.candidate >= embeddings.nrows() {
            return Err(ShgatError::CandidateOutOfRange {
                index: example.candidate,
                len: embeddings.nrows(),
            });
        }
        let i_tilde = project_intent(params, &example.intent)?;
        let candidate_row = embeddings.row(example.candidate);

        let q_heads: Vec<Array1<f32>> = params
            .heads
            .iter()
            .map(|head| matvec(head.w_q.view(), i_tilde.view()))
            .collect();
        let k_heads: Vec<Array1<f32>> = params
            .heads
            .iter()
            .map(|head| matvec(head.w_k.view(), candidate_row))
            .collect();

        let mut logit = 0.0f32;
        for h in 0..num_heads {
            logit += q_heads[h].dot(&k_heads[h]) * scale;
        }
        logit *= head_mean;

        let score = sigmoid(logit);
        loss -= example.target * (score + LOG_EPS).ln()
            + (1.0 - example.target) * (1.0 - score + LOG_EPS).ln();
        if (score >= 0.5) == (example.target >= 0.5) {
            hits += 1;
        }
        td_errors.push((score - example.target).abs());

        let d_logit = score - example.target;
        let coef = d_logit * scale * head_mean;
        let mut d_i_tilde = Array1::<f32>::zeros(i_tilde.len());
        for h in 0..num_heads {
            grads.w_q[h].scaled_add(coef, &outer(k_heads[h].view(), i_tilde.view()));
            grads.w_k[h].scaled_add(coef, &outer(q_heads[h].view(), candidate_row));
            d_i_tilde.scaled_add(coef, &matvec(params.heads[h].w_q.t(), k_heads[h].view()));
            let dk = matvec(params.heads[h].w_k.t(), q_heads[h].view());
            for c in 0..dk.len() {
                d_embeddings[[example.candidate, c]] += coef * dk[c];
            }
        }
        let i = ndarray::ArrayView1::from(example.intent.as_slice());
        grads.w_intent += &outer(d_i_tilde.view(), i);
    }

    Ok(ContrastiveBackward {
        loss: loss / examples.len() as f32,
        accuracy: hits as f32 / examples.len() as f32,
        grads,
        d_embeddings,
        td_errors,
    })
}

/// One epoch of mini-batch SGD over a flat candidate embedding matrix (the
/// training-kernel path: no message passing, head tensors only).
pub fn train_epoch_flat(
    params: &mut ShgatParams,
    embeddings: ArrayView2<'_, f32>,
    examples: &[ContrastiveExample],
    options: &TrainOptions,
    rng: &mut impl Rng,
) -> Result<TrainStats> {
    let mut order: Vec<usize> = (0..examples.len()).collect();
    fisher_yates(&mut order, rng);

    let batch_size = options.batch_size.max(1);
    let mut total_loss = 0.0f32;
    let mut total_acc = 0.0f32;
    let mut last_norm = 0.0f32;
    let mut batches = 0usize;

    for chunk in order.chunks(batch_size) {
        let batch: Vec<ContrastiveExample> =
            chunk.iter().map(|idx| examples[*idx].clone()).collect();
        let mut backward = info_nce_backward(params, embeddings, &batch, options.tau)?;
        last_norm = backward.grads.clip_global_norm(GRAD_CLIP_NORM);
        params.apply_sgd(&backward.grads, options.learning_rate);
        total_loss += backward.loss;
        total_acc += backward.accuracy;
        batches += 1;
    }

    Ok(TrainStats {
        mean_loss: total_loss / batches.max(1) as f32,
        accuracy: total_acc / batches.max(1) as f32,
        grad_norm: last_norm,
    })
}

/// One full-pipeline training step over a graph view: orchestrated forward,
/// InfoNCE on the refined capability embeddings, backward through every
/// phase, clipped SGD on all parameter blocks.
#[instrument(name = "shgat.train_graph", skip_all, fields(examples = examples.len()))]
pub fn train_step_graph(
    params: &mut ShgatParams,
    view: &GraphView,
    examples: &[ContrastiveExample],
    options: &TrainOptions,
) -> Result<TrainStats> {
    let (propagated, cache) = MultiLevelOrchestrator::forward_with_cache(params, view);
    let mut backward =
        info_nce_backward(params, propagated.e_final.view(), examples, options.tau)?;

    let multi = MultiLevelOrchestrator::backward_multi_level(
        params,
        view,
        &cache,
        backward.d_embeddings.view(),
    );
    backward.grads.levels = multi.levels;
    backward.grads.v2v.residual_logit = multi.v2v.residual_logit;
    backward.grads.v2v.temperature_logit = multi.v2v.temperature_logit;

    let norm = backward.grads.clip_global_norm(GRAD_CLIP_NORM);
    params.apply_sgd(&backward.grads, options.learning_rate);

    Ok(TrainStats {
        mean_loss: backward.loss,
        accuracy: backward.accuracy,
        grad_norm: norm,
    })
}

/// SHGAT model handle: parameters behind an atomic swap.
pub struct ShgatModel {
    params: ArcSwap<ShgatParams>,
}

impl ShgatModel {
    /// Wraps an existing parameter set.
    pub fn new(params: ShgatParams) -> Self {
        Self {
            params: ArcSwap::from_pointee(params),
        }
    }

    /// Initializes from the adaptive geometry for the given graph bounds.
    pub fn with_adaptive(embedding_dim: usize, max_level: usize, graph_size: usize, seed: u64) -> Self {
        let plan = adaptive_heads_by_graph_size(graph_size, max_level);
        Self::new(ShgatParams::init(embedding_dim, max_level, plan, seed))
    }

    /// Current coherent parameter set.
    pub fn params(&self) -> Arc<ShgatParams> {
        self.params.load_full()
    }

    /// Re-initializes only when the adaptive bounds changed. Returns whether
    /// a re-initialization happened.
    pub fn ensure_geometry(&self, graph_size: usize, max_level: usize, seed: u64) -> bool {
        let current = self.params.load();
        let plan = adaptive_heads_by_graph_size(graph_size, max_level);
        if current.plan == plan && current.max_level == max_level {
            return false;
        }
        info!(
            heads = plan.num_heads,
            head_dim = plan.head_dim,
            max_level,
            "adaptive bounds changed, re-initializing parameters"
        );
        let params = ShgatParams::init(current.embedding_dim, max_level, plan, seed);
        self.params.store(Arc::new(params));
        true
    }

    /// Exports the current parameters as a JSON blob.
    pub fn export_params(&self) -> Result<serde_json::Value> {
        self.params.load().export()
    }

    /// Validates and atomically swaps in an imported parameter blob.
    ///
    /// The embedding dimension must match the live set; on any mismatch the
    /// in-memory parameters are kept.
    pub fn import_params(&self, blob: serde_json::Value) -> Result<()> {
        let imported = ShgatParams::import(blob)?;
        let current = self.params.load();
        if imported.embedding_dim != current.embedding_dim {
            return Err(ShgatError::ParamSchemaMismatch(format!(
                "embedding dim {} (live set uses {})",
                imported.embedding_dim, current.embedding_dim
            )));
        }
        debug!(updated_at = %imported.updated_at, "parameters swapped");
        self.params.store(Arc::new(imported));
        Ok(())
    }

    /// Runs the full forward pass under the current parameters.
    pub fn forward(&self, view: &GraphView) -> Propagated {
        MultiLevelOrchestrator::forward(&self.params.load(), view)
    }

    /// Scores candidate capabilities (flat indices) against an intent, with
    /// one shared forward pass.
    pub fn score(
        &self,
        view: &GraphView,
        intent: &[f32],
        candidates: &[usize],
    ) -> Result<Vec<ScoredCandidate>> {
        let params = self.params.load();
        let propagated = MultiLevelOrchestrator::forward(&params, view);
        score_candidates(&params, propagated.e_final.view(), intent, candidates)
    }
}
