//! Grouped multi-head attention phase.
//!
//! One template serves V→E, E→E upward, E→E downward, and E→V: a set of
//! *receivers* attends over per-receiver groups of *senders*. Logits are
//! computed in projected head space (`w_recv`, `w_send`, logit vector `a`);
//! aggregation runs over the senders' original d-dimensional embeddings and
//! is mixed back residually, `normalize(recv + ELU(agg))`, the same shape
//! the V→V phase uses. Every phase preserves the input dimensionality and
//! the receiver's own identity.
//!
//! Receivers with an empty group pass through unchanged.

use ndarray::{Array1, Array2, ArrayView2};

use crate::linalg::{
    elu, elu_prime, leaky_relu, leaky_relu_prime, matmul, softmax, softmax_backward,
};

const NORM_EPS: f32 = 1e-8;

/// Forward cache for one phase invocation.
///
/// Retains the projected matrices, pre-activations (for the LeakyReLU
/// masks), softmax weights, and the aggregated pre-ELU values.
#[derive(Debug, Clone)]
pub struct AttentionCache {
    pub groups: Vec<Vec<usize>>,
    /// Per head: receivers × head_dim.
    pub recv_proj: Vec<Array2<f32>>,
    /// Per head: senders × head_dim.
    pub send_proj: Vec<Array2<f32>>,
    /// head → receiver → pre-activation logits, group order.
    pub pre_logits: Vec<Vec<Vec<f32>>>,
    /// head → receiver → softmax weights, group order.
    pub attn: Vec<Vec<Vec<f32>>>,
    /// Mean-over-heads aggregate before the ELU, receivers × d.
    pub pre_elu: Array2<f32>,
    /// Residual mix `recv + ELU(pre_elu)` before normalization.
    pub pre_norm: Array2<f32>,
    /// Norms of `pre_norm` rows.
    pub norms: Vec<f32>,
    /// Receivers with empty groups (identity rows).
    pub passthrough: Vec<bool>,
}

/// Gradients of one phase's parameters.
#[derive(Debug, Clone)]
pub struct AttentionGrads {
    pub w_recv: Vec<Array2<f32>>,
    pub w_send: Vec<Array2<f32>>,
    pub a: Vec<Array1<f32>>,
}

/// Forward pass retaining the cache needed by [`backward`].
pub fn forward_with_cache(
    receivers: ArrayView2<'_, f32>,
    senders: ArrayView2<'_, f32>,
    groups: &[Vec<usize>],
    w_recv: &[Array2<f32>],
    w_send: &[Array2<f32>],
    a: &[Array1<f32>],
) -> (Array2<f32>, AttentionCache) {
    let num_heads = w_recv.len();
    let head_dim = w_recv[0].nrows();
    let (num_recv, dim) = receivers.dim();
    debug_assert_eq!(groups.len(), num_recv);
    debug_assert_eq!(senders.ncols(), dim);

    let mut recv_proj = Vec::with_capacity(num_heads);
    let mut send_proj = Vec::with_capacity(num_heads);
    for h in 0..num_heads {
        recv_proj.push(matmul(receivers, w_recv[h].t()));
        send_proj.push(matmul(senders, w_send[h].t()));
    }

    let passthrough: Vec<bool> = groups.iter().map(Vec::is_empty).collect();

    let mut pre_logits = vec![Vec::with_capacity(num_recv); num_heads];
    let mut attn = vec![Vec::with_capacity(num_recv); num_heads];
    let mut pre_elu = Array2::<f32>::zeros((num_recv, dim));
    let head_scale = 1.0 / num_heads as f32;

    for h in 0..num_heads {
        let a_recv = a[h].slice(ndarray::s![..head_dim]);
        let a_send = a[h].slice(ndarray::s![head_dim..]);

        // Per-node logit halves; the pair logit is their sum.
        let recv_scores: Vec<f32> = (0..num_recv)
            .map(|r| a_recv.dot(&recv_proj[h].row(r)))
            .collect();
        let send_scores: Vec<f32> = (0..senders.nrows())
            .map(|s| a_send.dot(&send_proj[h].row(s)))
            .collect();

        for (r, group) in groups.iter().enumerate() {
            if group.is_empty() {
                pre_logits[h].push(Vec::new());
                attn[h].push(Vec::new());
                continue;
            }
            let z: Vec<f32> = group
                .iter()
                .map(|s| recv_scores[r] + send_scores[*s])
                .collect();
            let activated: Vec<f32> = z.iter().map(|v| leaky_relu(*v)).collect();
            let weights = softmax(&activated);

            let mut row = pre_elu.row_mut(r);
            for (j, s) in group.iter().enumerate() {
                let w = weights[j] * head_scale;
                let sender = senders.row(*s);
                for c in 0..dim {
                    row[c] += w * sender[c];
                }
            }

            pre_logits[h].push(z);
            attn[h].push(weights);
        }
    }

    let mut out = Array2::<f32>::zeros((num_recv, dim));
    let mut pre_norm = Array2::<f32>::zeros((num_recv, dim));
    let mut norms = vec![0.0f32; num_recv];
    for r in 0..num_recv {
        if passthrough[r] {
            out.row_mut(r).assign(&receivers.row(r));
            pre_norm.row_mut(r).assign(&receivers.row(r));
            norms[r] = 1.0;
            continue;
        }
        for c in 0..dim {
            pre_norm[[r, c]] = receivers[[r, c]] + elu(pre_elu[[r, c]]);
        }
        let norm = pre_norm
            .row(r)
            .dot(&pre_norm.row(r))
            .sqrt()
            .max(NORM_EPS);
        norms[r] = norm;
        for c in 0..dim {
            out[[r, c]] = pre_norm[[r, c]] / norm;
        }
    }

    let cache = AttentionCache {
        groups: groups.to_vec(),
        recv_proj,
        send_proj,
        pre_logits,
        attn,
        pre_elu,
        pre_norm,
        norms,
        passthrough,
    };
    (out, cache)
}

/// Forward pass without cache retention; output is identical to
/// [`forward_with_cache`].
pub fn forward(
    receivers: ArrayView2<'_, f32>,
    senders: ArrayView2<'_, f32>,
    groups: &[Vec<usize>],
    w_recv: &[Array2<f32>],
    w_send: &[Array2<f32>],
    a: &[Array1<f32>],
) -> Array2<f32> {
    forward_with_cache(receivers, senders, groups, w_recv, w_send, a).0
}

/// Backward pass.
///
/// Returns the parameter gradients plus the gradients flowing back into the
/// receiver and sender embeddings.
pub fn backward(
    d_out: ArrayView2<'_, f32>,
    cache: &AttentionCache,
    receivers: ArrayView2<'_, f32>,
    senders: ArrayView2<'_, f32>,
    w_recv: &[Array2<f32>],
    w_send: &[Array2<f32>],
    a: &[Array1<f32>],
) -> (AttentionGrads, Array2<f32>, Array2<f32>) {
    let num_heads = w_recv.len();
    let head_dim = w_recv[0].nrows();
    let (num_recv, dim) = receivers.dim();
    let num_send = senders.nrows();
    let head_scale = 1.0 / num_heads as f32;

    let mut d_receivers = Array2::<f32>::zeros((num_recv, dim));
    let mut d_senders = Array2::<f32>::zeros((num_send, dim));
    let mut d_recv_proj: Vec<Array2<f32>> = (0..num_heads)
        .map(|_| Array2::zeros((num_recv, head_dim)))
        .collect();
    let mut d_send_proj: Vec<Array2<f32>> = (0..num_heads)
        .map(|_| Array2::zeros((num_send, head_dim)))
        .collect();
    let mut d_a: Vec<Array1<f32>> = (0..num_heads).map(|_| Array1::zeros(2 * head_dim)).collect();

    for r in 0..num_recv {
        if cache.passthrough[r] {
            for c in 0..dim {
                d_receivers[[r, c]] += d_out[[r, c]];
            }
            continue;
        }

        // Normalize backward: y = u/‖u‖ ⇒ du = (dy − y (y·dy))/‖u‖.
        let norm = cache.norms[r];
        let mut y_dot_dy = 0.0f32;
        for c in 0..dim {
            y_dot_dy += (cache.pre_norm[[r, c]] / norm) * d_out[[r, c]];
        }
        // Residual and ELU backward on the mean-head aggregate.
        let mut d_pre = vec![0.0f32; dim];
        for c in 0..dim {
            let y = cache.pre_norm[[r, c]] / norm;
            let d_u = (d_out[[r, c]] - y * y_dot_dy) / norm;
            d_receivers[[r, c]] += d_u;
            d_pre[c] = d_u * elu_prime(cache.pre_elu[[r, c]]);
        }

        let group = &cache.groups[r];
        for h in 0..num_heads {
            let weights = &cache.attn[h][r];
            let z = &cache.pre_logits[h][r];

            // Attention-value path and dα.
            let mut d_alpha = vec![0.0f32; group.len()];
            for (j, s) in group.iter().enumerate() {
                let sender = senders.row(*s);
                let mut dot = 0.0f32;
                for c in 0..dim {
                    dot += d_pre[c] * sender[c];
                    d_senders[[*s, c]] += weights[j] * head_scale * d_pre[c];
                }
                d_alpha[j] = head_scale * dot;
            }

            let d_act = softmax_backward(weights, &d_alpha);
            let dz: Vec<f32> = d_act
                .iter()
                .zip(z.iter())
                .map(|(da, zv)| da * leaky_relu_prime(*zv))
                .collect();
            let dz_sum: f32 = dz.iter().sum();

            // Logit halves: z = a_recv·P'[r] + a_send·S'[s].
            let a_recv = a[h].slice(ndarray::s![..head_dim]);
            let a_send = a[h].slice(ndarray::s![head_dim..]);

            for k in 0..head_dim {
                d_a[h][k] += dz_sum * cache.recv_proj[h][[r, k]];
                d_recv_proj[h][[r, k]] += dz_sum * a_recv[k];
            }
            for (j, s) in group.iter().enumerate() {
                if dz[j] == 0.0 {
                    continue;
                }
                for k in 0..head_dim {
                    d_a[h][head_dim + k] += dz[j] * cache.send_proj[h][[*s, k]];
                    d_send_proj[h][[*s, k]] += dz[j] * a_send[k];
                }
            }
        }
    }

    // Projection path: W' = X · Wᵀ ⇒ dW = dW'ᵀ · X, dX = dW' · W.
    let mut d_w_recv = Vec::with_capacity(num_heads);
    let mut d_w_send = Vec::with_capacity(num_heads);
    for h in 0..num_heads {
        d_w_recv.push(matmul(d_recv_proj[h].t(), receivers));
        d_w_send.push(matmul(d_send_proj[h].t(), senders));
        d_receivers += &matmul(d_recv_proj[h].view(), w_recv[h].view());
        d_senders += &matmul(d_send_proj[h].view(), w_send[h].view());
    }

    (
        AttentionGrads {
            w_recv: d_w_recv,
            w_send: d_w_send,
            a: d_a,
        },
        d_receivers,
        d_senders,
    )
}
