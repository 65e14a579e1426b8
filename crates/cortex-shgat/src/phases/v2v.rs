//! V→V co-occurrence enrichment.
//!
//! Tool embeddings attend over their co-occurrence neighbors before any
//! hyperedge aggregation. Only two scalars train here (residual mix β and
//! temperature T); the cosine similarity is treated as a constant in the
//! backward pass, so gradients flow through the attention weights and the
//! residual only.

use cortex_hypergraph::view::CooccurrenceEdge;
use ndarray::{Array2, ArrayView2};

use crate::linalg::{softmax, softmax_backward};
use crate::params::{V2vGrads, V2vParams};

const NORM_EPS: f32 = 1e-8;

/// Forward cache for one V→V invocation.
#[derive(Debug, Clone)]
pub struct V2vCache {
    /// Per tool: (neighbor index, co-occurrence weight), edge order.
    pub groups: Vec<Vec<(usize, f32)>>,
    /// Per tool: cosine similarities to each neighbor.
    pub cos: Vec<Vec<f32>>,
    /// Per tool: pre-softmax scores `cos · w / T`.
    pub scores: Vec<Vec<f32>>,
    /// Per tool: softmax attention weights.
    pub attn: Vec<Vec<f32>>,
    /// Aggregated neighbor embeddings, tools × d.
    pub agg: Array2<f32>,
    /// Residual mix before normalization, tools × d.
    pub pre_norm: Array2<f32>,
    /// Norms of `pre_norm` rows.
    pub norms: Vec<f32>,
    pub beta: f32,
    pub temperature: f32,
}

/// Forward pass retaining the cache needed by [`backward`].
pub fn forward_with_cache(
    h: ArrayView2<'_, f32>,
    edges: &[CooccurrenceEdge],
    params: &V2vParams,
) -> (Array2<f32>, V2vCache) {
    let (n, dim) = h.dim();
    let beta = params.beta();
    let temperature = params.temperature();

    let mut groups: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n];
    for edge in edges {
        if edge.from < n && edge.to < n {
            groups[edge.from].push((edge.to, edge.weight));
        }
    }

    let norms_h: Vec<f32> = (0..n)
        .map(|i| h.row(i).dot(&h.row(i)).sqrt())
        .collect();

    let mut cos = vec![Vec::new(); n];
    let mut scores = vec![Vec::new(); n];
    let mut attn = vec![Vec::new(); n];
    let mut agg = Array2::<f32>::zeros((n, dim));
    let mut pre_norm = Array2::<f32>::zeros((n, dim));
    let mut norms = vec![0.0f32; n];
    let mut out = Array2::<f32>::zeros((n, dim));

    for i in 0..n {
        if groups[i].is_empty() {
            out.row_mut(i).assign(&h.row(i));
            pre_norm.row_mut(i).assign(&h.row(i));
            norms[i] = norms_h[i].max(NORM_EPS);
            continue;
        }

        for (j, w) in &groups[i] {
            let denom = (norms_h[i] * norms_h[*j]).max(NORM_EPS);
            let c = h.row(i).dot(&h.row(*j)) / denom;
            cos[i].push(c);
            scores[i].push(c * w / temperature);
        }
        attn[i] = softmax(&scores[i]);

        for (idx, (j, _)) in groups[i].iter().enumerate() {
            let weight = attn[i][idx];
            let neighbor = h.row(*j);
            let mut row = agg.row_mut(i);
            for c in 0..dim {
                row[c] += weight * neighbor[c];
            }
        }

        for c in 0..dim {
            pre_norm[[i, c]] = h[[i, c]] + beta * agg[[i, c]];
        }
        let norm = pre_norm.row(i).dot(&pre_norm.row(i)).sqrt().max(NORM_EPS);
        norms[i] = norm;
        for c in 0..dim {
            out[[i, c]] = pre_norm[[i, c]] / norm;
        }
    }

    let cache = V2vCache {
        groups,
        cos,
        scores,
        attn,
        agg,
        pre_norm,
        norms,
        beta,
        temperature,
    };
    (out, cache)
}

/// Forward pass without cache retention.
pub fn forward(
    h: ArrayView2<'_, f32>,
    edges: &[CooccurrenceEdge],
    params: &V2vParams,
) -> Array2<f32> {
    forward_with_cache(h, edges, params).0
}

/// Backward pass.
///
/// Returns gradients on the two trainable logits plus the gradient flowing
/// back into the tool embeddings. The cosine term is held constant.
pub fn backward(
    d_out: ArrayView2<'_, f32>,
    cache: &V2vCache,
    h: ArrayView2<'_, f32>,
) -> (V2vGrads, Array2<f32>) {
    let (n, dim) = h.dim();
    let mut d_h = Array2::<f32>::zeros((n, dim));
    let mut d_beta = 0.0f32;
    let mut d_temperature = 0.0f32;

    for i in 0..n {
        if cache.groups[i].is_empty() {
            for c in 0..dim {
                d_h[[i, c]] += d_out[[i, c]];
            }
            continue;
        }

        // Normalize backward: y = u / ‖u‖ ⇒ du = (dy − y (y·dy)) / ‖u‖.
        let norm = cache.norms[i];
        let mut y_dot_dy = 0.0f32;
        for c in 0..dim {
            y_dot_dy += (cache.pre_norm[[i, c]] / norm) * d_out[[i, c]];
        }
        let mut d_u = vec![0.0f32; dim];
        for c in 0..dim {
            let y = cache.pre_norm[[i, c]] / norm;
            d_u[c] = (d_out[[i, c]] - y * y_dot_dy) / norm;
        }

        // u = h_i + β · agg_i.
        let mut d_agg = vec![0.0f32; dim];
        for c in 0..dim {
            d_h[[i, c]] += d_u[c];
            d_beta += d_u[c] * cache.agg[[i, c]];
            d_agg[c] = cache.beta * d_u[c];
        }

        // agg_i = Σ_j α_j · h_j.
        let group = &cache.groups[i];
        let mut d_alpha = vec![0.0f32; group.len()];
        for (idx, (j, _)) in group.iter().enumerate() {
            let neighbor = h.row(*j);
            let mut dot = 0.0f32;
            for c in 0..dim {
                dot += d_agg[c] * neighbor[c];
                d_h[[*j, c]] += cache.attn[i][idx] * d_agg[c];
            }
            d_alpha[idx] = dot;
        }

        let d_score = softmax_backward(&cache.attn[i], &d_alpha);
        // s = cos · w / T ⇒ ∂s/∂T = −s / T.
        for (idx, _) in group.iter().enumerate() {
            d_temperature += d_score[idx] * (-cache.scores[i][idx] / cache.temperature);
        }
    }

    // Chain onto the logits: β = σ(r), T = exp(t).
    let grads = V2vGrads {
        residual_logit: d_beta * cache.beta * (1.0 - cache.beta),
        temperature_logit: d_temperature * cache.temperature,
    };
    (grads, d_h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::seeded_rng;
    use rand::Rng;

    fn inputs(n: usize, dim: usize, seed: u64) -> (Array2<f32>, Vec<CooccurrenceEdge>) {
        let mut rng = seeded_rng(seed);
        let h = Array2::from_shape_fn((n, dim), |_| rng.gen_range(-1.0..1.0));
        let mut edges = Vec::new();
        for i in 0..n {
            for j in 0..n {
                if i != j && (i + 2 * j) % 3 == 0 {
                    edges.push(CooccurrenceEdge {
                        from: i,
                        to: j,
                        weight: 0.5 + 0.1 * (j as f32),
                    });
                }
            }
        }
        (h, edges)
    }

    #[test]
    fn test_dimension_preserved_and_rows_unit() {
        let (h, edges) = inputs(5, 6, 1);
        let params = V2vParams {
            residual_logit: 0.0,
            temperature_logit: 0.0,
        };
        let (out, cache) = forward_with_cache(h.view(), &edges, &params);
        assert_eq!(out.dim(), (5, 6));
        for i in 0..5 {
            if !cache.groups[i].is_empty() {
                let norm = out.row(i).dot(&out.row(i)).sqrt();
                assert!((norm - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_isolated_tool_passes_through() {
        let (h, _) = inputs(3, 4, 2);
        let params = V2vParams {
            residual_logit: -0.5,
            temperature_logit: 0.2,
        };
        let (out, _) = forward_with_cache(h.view(), &[], &params);
        assert_eq!(out, h);
    }

    #[test]
    fn test_forward_matches_forward_with_cache() {
        let (h, edges) = inputs(4, 5, 3);
        let params = V2vParams {
            residual_logit: 0.3,
            temperature_logit: -0.1,
        };
        let (cached, _) = forward_with_cache(h.view(), &edges, &params);
        assert_eq!(cached, forward(h.view(), &edges, &params));
    }
}
