//! Multi-level phase sequencing.
//!
//! Forward order: `V→V → V→E → E→E upward(1..L) → E→E downward(L..1) → E→V`.
//! Every intermediate is cached so `backward_multi_level` can walk the exact
//! reverse chain. Embeddings are frozen inputs; only parameters receive
//! updates, but input gradients are still propagated between stages so the
//! chain composes.
//!
//! Role/parameter mapping per transition:
//! - V→E: level-0 caps receive (via `w_parent`, `a_upward` of level 0) from
//!   their incident tools (via `w_child`).
//! - upward k−1→k: level-k caps receive (`w_parent`, `a_upward` of level k)
//!   from their children (`w_child`).
//! - downward k→k−1: level-(k−1) caps receive (`w_child`, `a_downward` of
//!   level k) from their parents (`w_parent`).
//! - E→V: tools receive (`w_child`, `a_downward` of level 0) from the
//!   refined capabilities containing them (`w_parent`).

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2};
use tracing::instrument;

use cortex_hypergraph::view::GraphView;

use crate::params::{LevelGrads, ShgatParams, V2vGrads};
use crate::phases::attention::{self, AttentionCache};
use crate::phases::v2v::{self, V2vCache};

/// Final propagated embeddings.
#[derive(Debug, Clone)]
pub struct Propagated {
    /// Refined capability embeddings, one row per flat capability index.
    pub e_final: Array2<f32>,
    /// Refined tool embeddings from the E→V projection.
    pub h_final: Array2<f32>,
}

/// Full forward cache across every phase.
pub struct PropagationCache {
    /// Tool embeddings as loaded from the view.
    h_input: Array2<f32>,
    /// Tool embeddings after V→V (equal to `h_input` when V→V is skipped).
    h_enriched: Array2<f32>,
    v2v: Option<V2vCache>,
    /// Frozen capability embeddings grouped per level.
    frozen: Vec<Array2<f32>>,
    /// V→E phase cache (carries the level-0 cap → tool groups).
    v2e: AttentionCache,
    /// Stage-B (post-upward) embeddings per level; `e_up[0]` is the V→E out.
    e_up: Vec<Array2<f32>>,
    /// Upward transition caches and groups, index k−1 holds transition into
    /// level k.
    upward: Vec<(Vec<Vec<usize>>, AttentionCache)>,
    /// Final embeddings per level after the downward pass.
    e_final: Vec<Array2<f32>>,
    /// Downward transition caches and groups, index k−1 holds the
    /// transition refining level k−1.
    downward: Vec<Option<(Vec<Vec<usize>>, AttentionCache)>>,
    /// Effective top level for this view.
    top_level: usize,
}

/// Gradients produced by [`MultiLevelOrchestrator::backward_multi_level`].
pub struct MultiLevelGrads {
    pub levels: Vec<LevelGrads>,
    pub v2v: V2vGrads,
    /// Gradient on the input tool embeddings.
    pub d_h: Array2<f32>,
}

/// Stateless sequencer over the phases.
pub struct MultiLevelOrchestrator;

impl MultiLevelOrchestrator {
    /// Forward pass without cache retention; identical output to
    /// [`Self::forward_with_cache`].
    pub fn forward(params: &ShgatParams, view: &GraphView) -> Propagated {
        Self::forward_with_cache(params, view).0
    }

    /// Full forward pass with cached intermediates.
    #[instrument(name = "shgat.forward", skip_all, fields(tools = view.tool_ids.len(), caps = view.cap_ids.len()))]
    pub fn forward_with_cache(
        params: &ShgatParams,
        view: &GraphView,
    ) -> (Propagated, PropagationCache) {
        let dim = view.dim;
        let num_tools = view.tool_ids.len();
        let top_level = view.max_level().min(params.max_level);

        let h_input = rows_matrix(&view.tool_embeddings, num_tools, dim);

        // V→V runs only when co-occurrence data exists.
        let (h_enriched, v2v_cache) = if view.has_cooccurrence() {
            let (out, cache) = v2v::forward_with_cache(h_input.view(), &view.cooccurrence, &params.v2v);
            (out, Some(cache))
        } else {
            (h_input.clone(), None)
        };

        // Frozen capability embeddings per level, in level order.
        let frozen: Vec<Array2<f32>> = (0..=top_level)
            .map(|k| level_matrix(view, k, dim))
            .collect();

        // V→E: level-0 caps aggregate their incident tools.
        let v2e_groups: Vec<Vec<usize>> = level_flats(view, 0)
            .iter()
            .map(|flat| view.incidence[*flat].clone())
            .collect();
        let level0 = &params.levels[0];
        let (e0, v2e_cache) = attention::forward_with_cache(
            frozen[0].view(),
            h_enriched.view(),
            &v2e_groups,
            &level0.w_parent,
            &level0.w_child,
            &level0.a_upward,
        );

        // Upward: level k aggregates its children's stage-B embeddings.
        let mut e_up: Vec<Array2<f32>> = Vec::with_capacity(top_level + 1);
        e_up.push(e0);
        let mut upward = Vec::with_capacity(top_level);
        for k in 1..=top_level {
            let groups = child_groups(view, k);
            let block = &params.levels[k];
            let (out, cache) = attention::forward_with_cache(
                frozen[k].view(),
                e_up[k - 1].view(),
                &groups,
                &block.w_parent,
                &block.w_child,
                &block.a_upward,
            );
            e_up.push(out);
            upward.push((groups, cache));
        }

        // Downward: level k−1 is refined by its parents, top to bottom.
        let mut e_final: Vec<Option<Array2<f32>>> = vec![None; top_level + 1];
        e_final[top_level] = Some(e_up[top_level].clone());
        let mut downward: Vec<Option<(Vec<Vec<usize>>, AttentionCache)>> =
            (0..top_level).map(|_| None).collect();
        for k in (1..=top_level).rev() {
            let groups = parent_groups(view, k);
            let block = &params.levels[k];
            let senders = e_final[k].as_ref().expect("upper level refined first");
            let (out, cache) = attention::forward_with_cache(
                e_up[k - 1].view(),
                senders.view(),
                &groups,
                &block.w_child,
                &block.w_parent,
                &block.a_downward,
            );
            e_final[k - 1] = Some(out);
            downward[k - 1] = Some((groups, cache));
        }
        let e_final: Vec<Array2<f32>> = e_final.into_iter().map(Option::unwrap).collect();

        // E→V: tools aggregate the refined capabilities containing them.
        let e_final_flat = flatten_levels(view, &e_final, dim);
        let tool_groups = tool_cap_groups(view, num_tools);
        let h_final = attention::forward(
            h_enriched.view(),
            e_final_flat.view(),
            &tool_groups,
            &level0.w_child,
            &level0.w_parent,
            &level0.a_downward,
        );

        let propagated = Propagated {
            e_final: e_final_flat,
            h_final,
        };
        let cache = PropagationCache {
            h_input,
            h_enriched,
            v2v: v2v_cache,
            frozen,
            v2e: v2e_cache,
            e_up,
            upward,
            e_final,
            downward,
            top_level,
        };
        (propagated, cache)
    }

    /// Backward pass from gradients on the flat refined capability
    /// embeddings down to the parameter and tool-embedding gradients.
    ///
    /// Loss gradients arrive in flat capability order and are routed into
    /// the per-level stages through the flat↔(level, offset) map.
    #[instrument(name = "shgat.backward", skip_all)]
    pub fn backward_multi_level(
        params: &ShgatParams,
        view: &GraphView,
        cache: &PropagationCache,
        d_e_final_flat: ArrayView2<'_, f32>,
    ) -> MultiLevelGrads {
        let dim = view.dim;
        let top_level = cache.top_level;
        let mut levels: Vec<LevelGrads> = params
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
                    .map(|v| ndarray::Array1::zeros(v.len()))
                    .collect(),
                a_downward: block
                    .a_downward
                    .iter()
                    .map(|v| ndarray::Array1::zeros(v.len()))
                    .collect(),
            })
            .collect();

        // Split the flat gradient into per-level blocks.
        let mut d_final: Vec<Array2<f32>> = (0..=top_level)
            .map(|k| Array2::zeros((level_flats(view, k).len(), dim)))
            .collect();
        for (flat, row) in d_e_final_flat.outer_iter().enumerate() {
            if let Some((level, offset)) = view.coords_of(flat) {
                if level <= top_level {
                    for c in 0..dim {
                        d_final[level][[offset, c]] += row[c];
                    }
                }
            }
        }

        let mut d_up: Vec<Array2<f32>> = cache
            .e_up
            .iter()
            .map(|m| Array2::zeros(m.dim()))
            .collect();

        // Downward transitions, reverse computation order (k = 1..=L).
        for k in 1..=top_level {
            let Some((_, phase_cache)) = cache.downward[k - 1].as_ref() else {
                continue;
            };
            let block = &params.levels[k];
            let senders = &cache.e_final[k];
            let (grads, d_recv, d_send) = attention::backward(
                d_final[k - 1].view(),
                phase_cache,
                cache.e_up[k - 1].view(),
                senders.view(),
                &block.w_child,
                &block.w_parent,
                &block.a_downward,
            );
            accumulate_level(&mut levels[k], grads.w_recv, GradSlot::WChild);
            accumulate_level(&mut levels[k], grads.w_send, GradSlot::WParent);
            accumulate_vectors(&mut levels[k].a_downward, grads.a);
            d_up[k - 1] += &d_recv;
            d_final[k] += &d_send;
        }

        // The top level is never refined downward.
        d_up[top_level] += &d_final[top_level];

        // Upward transitions, reverse computation order (k = L..=1).
        for k in (1..=top_level).rev() {
            let (_, phase_cache) = &cache.upward[k - 1];
            let block = &params.levels[k];
            let (grads, _d_frozen, d_send) = attention::backward(
                d_up[k].view(),
                phase_cache,
                cache.frozen[k].view(),
                cache.e_up[k - 1].view(),
                &block.w_parent,
                &block.w_child,
                &block.a_upward,
            );
            accumulate_level(&mut levels[k], grads.w_recv, GradSlot::WParent);
            accumulate_level(&mut levels[k], grads.w_send, GradSlot::WChild);
            accumulate_vectors(&mut levels[k].a_upward, grads.a);
            d_up[k - 1] += &d_send;
        }

        // V→E backward into the enriched tool embeddings.
        let level0 = &params.levels[0];
        let (grads, _d_frozen, d_h_enriched) = attention::backward(
            d_up[0].view(),
            &cache.v2e,
            cache.frozen[0].view(),
            cache.h_enriched.view(),
            &level0.w_parent,
            &level0.w_child,
            &level0.a_upward,
        );
        accumulate_level(&mut levels[0], grads.w_recv, GradSlot::WParent);
        accumulate_level(&mut levels[0], grads.w_send, GradSlot::WChild);
        accumulate_vectors(&mut levels[0].a_upward, grads.a);

        // V→V backward onto the raw tool embeddings.
        let (v2v_grads, d_h) = match cache.v2v.as_ref() {
            Some(v2v_cache) => v2v::backward(d_h_enriched.view(), v2v_cache, cache.h_input.view()),
            None => (V2vGrads::default(), d_h_enriched),
        };

        MultiLevelGrads {
            levels,
            v2v: v2v_grads,
            d_h,
        }
    }
}

enum GradSlot {
    WChild,
    WParent,
}

fn accumulate_level(block: &mut LevelGrads, grads: Vec<Array2<f32>>, slot: GradSlot) {
    let target = match slot {
        GradSlot::WChild => &mut block.w_child,
        GradSlot::WParent => &mut block.w_parent,
    };
    for (acc, grad) in target.iter_mut().zip(grads.into_iter()) {
        *acc += &grad;
    }
}

fn accumulate_vectors(target: &mut [ndarray::Array1<f32>], grads: Vec<ndarray::Array1<f32>>) {
    for (acc, grad) in target.iter_mut().zip(grads.into_iter()) {
        *acc += &grad;
    }
}

fn rows_matrix(rows: &[Vec<f32>], n: usize, dim: usize) -> Array2<f32> {
    let mut out = Array2::zeros((n, dim));
    for (i, row) in rows.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            out[[i, c]] = *value;
        }
    }
    out
}

fn level_flats(view: &GraphView, level: usize) -> &[usize] {
    view.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
}

fn level_matrix(view: &GraphView, level: usize, dim: usize) -> Array2<f32> {
    let flats = level_flats(view, level);
    let mut out = Array2::zeros((flats.len(), dim));
    for (offset, flat) in flats.iter().enumerate() {
        for (c, value) in view.cap_embeddings[*flat].iter().enumerate() {
            out[[offset, c]] = *value;
        }
    }
    out
}

/// Per level-k capability: offsets of its children within level k−1.
fn child_groups(view: &GraphView, level: usize) -> Vec<Vec<usize>> {
    let lower: HashMap<usize, usize> = level_flats(view, level - 1)
        .iter()
        .enumerate()
        .map(|(offset, flat)| (*flat, offset))
        .collect();
    level_flats(view, level)
        .iter()
        .map(|flat| {
            view.children[*flat]
                .iter()
                .filter_map(|child| lower.get(child).copied())
                .collect()
        })
        .collect()
}

/// Per level-(k−1) capability: offsets of its parents within level k.
fn parent_groups(view: &GraphView, level: usize) -> Vec<Vec<usize>> {
    let upper = level_flats(view, level);
    let lower = level_flats(view, level - 1);
    let lower_offset: HashMap<usize, usize> = lower
        .iter()
        .enumerate()
        .map(|(offset, flat)| (*flat, offset))
        .collect();

    let mut groups = vec![Vec::new(); lower.len()];
    for (parent_offset, parent_flat) in upper.iter().enumerate() {
        for child_flat in &view.children[*parent_flat] {
            if let Some(child_offset) = lower_offset.get(child_flat) {
                groups[*child_offset].push(parent_offset);
            }
        }
    }
    groups
}

/// Per tool: flat indices of the capabilities containing it.
fn tool_cap_groups(view: &GraphView, num_tools: usize) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); num_tools];
    for (flat, tools) in view.incidence.iter().enumerate() {
        for tool in tools {
            groups[*tool].push(flat);
        }
    }
    groups
}

fn flatten_levels(view: &GraphView, per_level: &[Array2<f32>], dim: usize) -> Array2<f32> {
    let mut out = Array2::zeros((view.cap_ids.len(), dim));
    for (level, matrix) in per_level.iter().enumerate() {
        for (offset, flat) in level_flats(view, level).iter().enumerate() {
            for c in 0..dim {
                out[[*flat, c]] = matrix[[offset, c]];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::adaptive_heads_by_graph_size;
    use cortex_hypergraph::view::CooccurrenceEdge;

    pub(crate) fn toy_view(dim: usize) -> GraphView {
        let tool = |seed: f32| {
            (0..dim)
                .map(|c| ((seed + c as f32) * 0.37).sin())
                .collect::<Vec<f32>>()
        };
        GraphView::assemble(
            dim,
            vec!["t0".into(), "t1".into(), "t2".into()],
            vec![tool(1.0), tool(2.0), tool(3.0)],
            vec![0.5, 0.6, 0.7],
            vec!["c0".into(), "c1".into(), "p0".into()],
            vec![0, 0, 1],
            vec![tool(4.0), tool(5.0), tool(6.0)],
            vec![0.5, 0.8, 0.6],
            vec![vec![0, 1], vec![1, 2], vec![0, 1, 2]],
            vec![vec![], vec![], vec![0, 1]],
            vec![
                CooccurrenceEdge {
                    from: 0,
                    to: 1,
                    weight: 0.5,
                },
                CooccurrenceEdge {
                    from: 1,
                    to: 2,
                    weight: 1.0,
                },
            ],
        )
    }

    fn toy_params(dim: usize) -> ShgatParams {
        let plan = adaptive_heads_by_graph_size(6, 1);
        ShgatParams::init(dim, 1, plan, 11)
    }

    #[test]
    fn test_forward_preserves_dimensions() {
        let view = toy_view(8);
        let params = toy_params(8);
        let propagated = MultiLevelOrchestrator::forward(&params, &view);
        assert_eq!(propagated.e_final.dim(), (3, 8));
        assert_eq!(propagated.h_final.dim(), (3, 8));
    }

    #[test]
    fn test_forward_with_cache_is_shadow() {
        let view = toy_view(8);
        let params = toy_params(8);
        let plain = MultiLevelOrchestrator::forward(&params, &view);
        let (cached, _) = MultiLevelOrchestrator::forward_with_cache(&params, &view);
        assert_eq!(plain.e_final, cached.e_final);
        assert_eq!(plain.h_final, cached.h_final);
    }

    #[test]
    fn test_forward_is_deterministic() {
        let view = toy_view(8);
        let params = toy_params(8);
        let a = MultiLevelOrchestrator::forward(&params, &view);
        let b = MultiLevelOrchestrator::forward(&params, &view);
        assert_eq!(a.e_final, b.e_final);
    }

    #[test]
    fn test_backward_produces_congruent_shapes() {
        let view = toy_view(8);
        let params = toy_params(8);
        let (_, cache) = MultiLevelOrchestrator::forward_with_cache(&params, &view);
        let d_e = Array2::from_elem((3, 8), 0.1f32);
        let grads =
            MultiLevelOrchestrator::backward_multi_level(&params, &view, &cache, d_e.view());
        assert_eq!(grads.levels.len(), params.levels.len());
        assert_eq!(grads.d_h.dim(), (3, 8));
        assert_eq!(
            grads.levels[0].w_child[0].dim(),
            params.levels[0].w_child[0].dim()
        );
        // With co-occurrence data present, V→V scalars receive gradient.
        assert!(grads.v2v.residual_logit != 0.0 || grads.v2v.temperature_logit != 0.0);
    }

    #[test]
    fn test_no_cooccurrence_skips_v2v() {
        let mut view = toy_view(8);
        view.cooccurrence.clear();
        let params = toy_params(8);
        let (_, cache) = MultiLevelOrchestrator::forward_with_cache(&params, &view);
        let d_e = Array2::from_elem((3, 8), 0.1f32);
        let grads =
            MultiLevelOrchestrator::backward_multi_level(&params, &view, &cache, d_e.view());
        assert_eq!(grads.v2v.residual_logit, 0.0);
        assert_eq!(grads.v2v.temperature_logit, 0.0);
    }
}
