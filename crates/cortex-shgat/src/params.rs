//! Learnable parameters: layout, seeded initialization, gradient
//! accumulators, and the JSON export/import boundary.

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::adaptive::HeadPlan;
use crate::error::{Result, ShgatError};
use crate::linalg::{logit, seeded_rng, sigmoid, small_uniform, xavier_uniform};

/// Version stamp carried by every exported parameter blob.
pub const PARAM_SCHEMA_VERSION: u32 = 1;

/// Per-level attention tensors, one entry per head.
///
/// `w_child`/`w_parent` project the sender/receiver embeddings into head
/// space for the attention logits; `a_upward`/`a_downward` are the logit
/// vectors for the upward and downward passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelParams {
    pub w_child: Vec<Array2<f32>>,
    pub w_parent: Vec<Array2<f32>>,
    pub a_upward: Vec<Array1<f32>>,
    pub a_downward: Vec<Array1<f32>>,
}

/// K-head scoring tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadParams {
    /// `scoring_dim × hidden_dim`; applied to the projected intent.
    pub w_q: Array2<f32>,
    /// `scoring_dim × d`; applied to the propagated capability embedding.
    pub w_k: Array2<f32>,
}

/// Learnable scalars of the V→V co-occurrence phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct V2vParams {
    pub residual_logit: f32,
    pub temperature_logit: f32,
}

impl V2vParams {
    /// Residual mixing factor β = σ(residual_logit).
    pub fn beta(&self) -> f32 {
        sigmoid(self.residual_logit)
    }

    /// Attention temperature T = exp(temperature_logit).
    pub fn temperature(&self) -> f32 {
        self.temperature_logit.exp()
    }
}

/// Complete parameter set of the SHGAT model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShgatParams {
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    pub embedding_dim: usize,
    pub max_level: usize,
    pub plan: HeadPlan,
    /// One entry per level 0..=max_level.
    pub levels: Vec<LevelParams>,
    /// `hidden_dim × d` intent projection.
    pub w_intent: Array2<f32>,
    pub heads: Vec<HeadParams>,
    pub v2v: V2vParams,
}

impl ShgatParams {
    /// Deterministic seeded initialization.
    ///
    /// Xavier/Glorot uniform for the projection matrices, small uniform for
    /// the attention vectors, `residual_logit = logit(0.3)` and
    /// `temperature_logit = 0` for the V→V scalars.
    pub fn init(embedding_dim: usize, max_level: usize, plan: HeadPlan, seed: u64) -> Self {
        let mut rng = seeded_rng(seed);
        let hd = plan.head_dim;

        let levels = (0..=max_level)
            .map(|_| LevelParams {
                w_child: (0..plan.num_heads)
                    .map(|_| xavier_uniform(hd, embedding_dim, &mut rng))
                    .collect(),
                w_parent: (0..plan.num_heads)
                    .map(|_| xavier_uniform(hd, embedding_dim, &mut rng))
                    .collect(),
                a_upward: (0..plan.num_heads)
                    .map(|_| small_uniform(2 * hd, &mut rng))
                    .collect(),
                a_downward: (0..plan.num_heads)
                    .map(|_| small_uniform(2 * hd, &mut rng))
                    .collect(),
            })
            .collect();

        let w_intent = xavier_uniform(plan.hidden_dim, embedding_dim, &mut rng);
        let heads = (0..plan.num_heads)
            .map(|_| HeadParams {
                w_q: xavier_uniform(plan.scoring_dim, plan.hidden_dim, &mut rng),
                w_k: xavier_uniform(plan.scoring_dim, embedding_dim, &mut rng),
            })
            .collect();

        Self {
            schema_version: PARAM_SCHEMA_VERSION,
            updated_at: Utc::now(),
            embedding_dim,
            max_level,
            plan,
            levels,
            w_intent,
            heads,
            v2v: V2vParams {
                residual_logit: logit(0.3),
                temperature_logit: 0.0,
            },
        }
    }

    /// Serializes the full parameter set to a JSON document.
    pub fn export(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserializes and shape-validates a parameter blob.
    ///
    /// Any disagreement with the declared geometry rejects the blob with
    /// [`ShgatError::ParamSchemaMismatch`]; the caller keeps its in-memory
    /// parameters.
    pub fn import(blob: serde_json::Value) -> Result<Self> {
        let params: ShgatParams = serde_json::from_value(blob)
            .map_err(|err| ShgatError::ParamSchemaMismatch(err.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Validates internal shape consistency.
    pub fn validate(&self) -> Result<()> {
        let mismatch = |detail: String| Err(ShgatError::ParamSchemaMismatch(detail));

        if self.schema_version != PARAM_SCHEMA_VERSION {
            return mismatch(format!(
                "schema version {} (expected {PARAM_SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        if self.plan.hidden_dim != self.plan.num_heads * self.plan.head_dim {
            return mismatch("hidden_dim != num_heads * head_dim".into());
        }
        if self.levels.len() != self.max_level + 1 {
            return mismatch(format!(
                "{} level blocks for max level {}",
                self.levels.len(),
                self.max_level
            ));
        }

        let hd = self.plan.head_dim;
        let d = self.embedding_dim;
        for (level, block) in self.levels.iter().enumerate() {
            let heads_ok = [
                block.w_child.len(),
                block.w_parent.len(),
                block.a_upward.len(),
                block.a_downward.len(),
            ]
            .iter()
            .all(|len| *len == self.plan.num_heads);
            if !heads_ok {
                return mismatch(format!("level {level} head count"));
            }
            for h in 0..self.plan.num_heads {
                if block.w_child[h].dim() != (hd, d) || block.w_parent[h].dim() != (hd, d) {
                    return mismatch(format!("level {level} head {h} projection shape"));
                }
                if block.a_upward[h].len() != 2 * hd || block.a_downward[h].len() != 2 * hd {
                    return mismatch(format!("level {level} head {h} attention vector length"));
                }
            }
        }

        if self.w_intent.dim() != (self.plan.hidden_dim, d) {
            return mismatch("w_intent shape".into());
        }
        if self.heads.len() != self.plan.num_heads {
            return mismatch("scoring head count".into());
        }
        for (h, head) in self.heads.iter().enumerate() {
            if head.w_q.dim() != (self.plan.scoring_dim, self.plan.hidden_dim) {
                return mismatch(format!("head {h} w_q shape"));
            }
            if head.w_k.dim() != (self.plan.scoring_dim, d) {
                return mismatch(format!("head {h} w_k shape"));
            }
        }
        Ok(())
    }
}

/// Per-level gradient block, shape-congruent with [`LevelParams`].
#[derive(Debug, Clone)]
pub struct LevelGrads {
    pub w_child: Vec<Array2<f32>>,
    pub w_parent: Vec<Array2<f32>>,
    pub a_upward: Vec<Array1<f32>>,
    pub a_downward: Vec<Array1<f32>>,
}

/// Gradients of the V→V scalars, expressed on the logits.
#[derive(Debug, Clone, Copy, Default)]
pub struct V2vGrads {
    pub residual_logit: f32,
    pub temperature_logit: f32,
}

/// Full gradient accumulator, shape-congruent with [`ShgatParams`].
#[derive(Debug, Clone)]
pub struct ShgatGrads {
    pub levels: Vec<LevelGrads>,
    pub w_intent: Array2<f32>,
    pub w_q: Vec<Array2<f32>>,
    pub w_k: Vec<Array2<f32>>,
    pub v2v: V2vGrads,
}

impl ShgatGrads {
    /// Zero gradients matching the parameter shapes.
    pub fn zeros_like(params: &ShgatParams) -> Self {
        let levels = params
            .levels
            .iter()
            .map(|block| LevelGrads {
                w_child: block.w_child.iter().map(|m| Array2::zeros(m.dim())).collect(),
                w_parent: block
                    .w_parent
                    .iter()
                    .map(|m| Array2::zeros(m.dim()))
                    .collect(),
                a_upward: block
                    .a_upward
                    .iter()
                    .map(|v| Array1::zeros(v.len()))
                    .collect(),
                a_downward: block
                    .a_downward
                    .iter()
                    .map(|v| Array1::zeros(v.len()))
                    .collect(),
            })
            .collect();

        Self {
            levels,
            w_intent: Array2::zeros(params.w_intent.dim()),
            w_q: params
                .heads
                .iter()
                .map(|head| Array2::zeros(head.w_q.dim()))
                .collect(),
            w_k: params
                .heads
                .iter()
                .map(|head| Array2::zeros(head.w_k.dim()))
                .collect(),
            v2v: V2vGrads::default(),
        }
    }

    /// Adds another accumulator of the same shape.
    pub fn accumulate(&mut self, other: &ShgatGrads) {
        for (mine, theirs) in self.levels.iter_mut().zip(other.levels.iter()) {
            for (a, b) in mine.w_child.iter_mut().zip(theirs.w_child.iter()) {
                *a += b;
            }
            for (a, b) in mine.w_parent.iter_mut().zip(theirs.w_parent.iter()) {
                *a += b;
            }
            for (a, b) in mine.a_upward.iter_mut().zip(theirs.a_upward.iter()) {
                *a += b;
            }
            for (a, b) in mine.a_downward.iter_mut().zip(theirs.a_downward.iter()) {
                *a += b;
            }
        }
        self.w_intent += &other.w_intent;
        for (a, b) in self.w_q.iter_mut().zip(other.w_q.iter()) {
            *a += b;
        }
        for (a, b) in self.w_k.iter_mut().zip(other.w_k.iter()) {
            *a += b;
        }
        self.v2v.residual_logit += other.v2v.residual_logit;
        self.v2v.temperature_logit += other.v2v.temperature_logit;
    }

    /// Global L2 norm over every component.
    pub fn global_norm(&self) -> f32 {
        let mut total = 0.0f64;
        let mut add2 = |x: f32| total += (x as f64) * (x as f64);

        for block in &self.levels {
            for m in block.w_child.iter().chain(block.w_parent.iter()) {
                m.iter().for_each(|v| add2(*v));
            }
            for v in block.a_upward.iter().chain(block.a_downward.iter()) {
                v.iter().for_each(|x| add2(*x));
            }
        }
        self.w_intent.iter().for_each(|v| add2(*v));
        for m in self.w_q.iter().chain(self.w_k.iter()) {
            m.iter().for_each(|v| add2(*v));
        }
        add2(self.v2v.residual_logit);
        add2(self.v2v.temperature_logit);
        total.sqrt() as f32
    }

    /// Rescales every gradient in place.
    pub fn scale(&mut self, factor: f32) {
        for block in &mut self.levels {
            for m in block.w_child.iter_mut().chain(block.w_parent.iter_mut()) {
                m.mapv_inplace(|v| v * factor);
            }
            for v in block.a_upward.iter_mut().chain(block.a_downward.iter_mut()) {
                v.mapv_inplace(|x| x * factor);
            }
        }
        self.w_intent.mapv_inplace(|v| v * factor);
        for m in self.w_q.iter_mut().chain(self.w_k.iter_mut()) {
            m.mapv_inplace(|v| v * factor);
        }
        self.v2v.residual_logit *= factor;
        self.v2v.temperature_logit *= factor;
    }

    /// Clips the global L2 norm to `max_norm`, returning the pre-clip norm.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
        norm
    }
}

impl ShgatParams {
    /// One SGD step: `θ ← θ − lr · g`. Refreshes `updated_at`.
    pub fn apply_sgd(&mut self, grads: &ShgatGrads, lr: f32) {
        for (block, gblock) in self.levels.iter_mut().zip(grads.levels.iter()) {
            for (m, g) in block.w_child.iter_mut().zip(gblock.w_child.iter()) {
                m.scaled_add(-lr, g);
            }
            for (m, g) in block.w_parent.iter_mut().zip(gblock.w_parent.iter()) {
                m.scaled_add(-lr, g);
            }
            for (v, g) in block.a_upward.iter_mut().zip(gblock.a_upward.iter()) {
                v.scaled_add(-lr, g);
            }
            for (v, g) in block.a_downward.iter_mut().zip(gblock.a_downward.iter()) {
                v.scaled_add(-lr, g);
            }
        }
        self.w_intent.scaled_add(-lr, &grads.w_intent);
        for (head, (gq, gk)) in self
            .heads
            .iter_mut()
            .zip(grads.w_q.iter().zip(grads.w_k.iter()))
        {
            head.w_q.scaled_add(-lr, gq);
            head.w_k.scaled_add(-lr, gk);
        }
        self.v2v.residual_logit -= lr * grads.v2v.residual_logit;
        self.v2v.temperature_logit -= lr * grads.v2v.temperature_logit;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::adaptive_heads_by_graph_size;

    fn small_params() -> ShgatParams {
        let plan = adaptive_heads_by_graph_size(10, 1);
        ShgatParams::init(8, 1, plan, 42)
    }

    #[test]
    fn test_init_shapes_validate() {
        let params = small_params();
        assert!(params.validate().is_ok());
        assert_eq!(params.levels.len(), 2);
        assert_eq!(params.heads.len(), 4);
        assert_eq!(params.w_intent.dim(), (64, 8));
        assert_eq!(params.heads[0].w_q.dim(), (16, 64));
        assert_eq!(params.heads[0].w_k.dim(), (16, 8));
    }

    #[test]
    fn test_init_is_deterministic() {
        let a = ShgatParams::init(8, 1, adaptive_heads_by_graph_size(10, 1), 7);
        let b = ShgatParams::init(8, 1, adaptive_heads_by_graph_size(10, 1), 7);
        assert_eq!(a.levels, b.levels);
        assert_eq!(a.w_intent, b.w_intent);
        assert_eq!(a.heads, b.heads);
    }

    #[test]
    fn test_v2v_defaults() {
        let params = small_params();
        assert!((params.v2v.beta() - 0.3).abs() < 1e-5);
        assert!((params.v2v.temperature() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_export_import_round_trip() {
        let params = small_params();
        let blob = params.export().unwrap();
        let restored = ShgatParams::import(blob.clone()).unwrap();
        assert_eq!(params, restored);
        // Byte-for-byte stable in the exported schema.
        assert_eq!(
            serde_json::to_string(&blob).unwrap(),
            serde_json::to_string(&restored.export().unwrap()).unwrap()
        );
    }

    #[test]
    fn test_import_rejects_bad_shapes() {
        let params = small_params();
        let mut blob = params.export().unwrap();
        blob["w_intent"]["dim"] = serde_json::json!([2, 8]);
        assert!(matches!(
            ShgatParams::import(blob),
            Err(ShgatError::ParamSchemaMismatch(_))
        ));
    }

    #[test]
    fn test_import_rejects_wrong_schema_version() {
        let params = small_params();
        let mut blob = params.export().unwrap();
        blob["schema_version"] = serde_json::json!(99);
        assert!(ShgatParams::import(blob).is_err());
    }

    #[test]
    fn test_grad_clip() {
        let params = small_params();
        let mut grads = ShgatGrads::zeros_like(&params);
        grads.w_intent.fill(1.0);
        let norm = grads.global_norm();
        assert!(norm > 5.0);

        let pre = grads.clip_global_norm(5.0);
        assert!((pre - norm).abs() < 1e-3);
        assert!((grads.global_norm() - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_sgd_moves_parameters() {
        let mut params = small_params();
        let before = params.w_intent.clone();
        let mut grads = ShgatGrads::zeros_like(&params);
        grads.w_intent.fill(1.0);
        params.apply_sgd(&grads, 0.1);
        assert!((params.w_intent[[0, 0]] - (before[[0, 0]] - 0.1)).abs() < 1e-6);
    }
}
