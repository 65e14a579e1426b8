//! Benchmarks for the forward/scoring hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cortex_hypergraph::view::{CooccurrenceEdge, GraphView};
use cortex_shgat::{
    adaptive_heads_by_graph_size, score_candidates, MultiLevelOrchestrator, ShgatParams,
};

const DIM: usize = 128;

fn synthetic_view(num_tools: usize, num_caps: usize) -> GraphView {
    let embed = |seed: usize| {
        (0..DIM)
            .map(|c| (((seed * 31 + c) as f32) * 0.113).sin())
            .collect::<Vec<f32>>()
    };

    let tool_ids: Vec<String> = (0..num_tools).map(|i| format!("tool-{i}")).collect();
    let tool_embeddings: Vec<Vec<f32>> = (0..num_tools).map(embed).collect();
    let cap_ids: Vec<String> = (0..num_caps).map(|i| format!("cap-{i}")).collect();
    let cap_embeddings: Vec<Vec<f32>> = (0..num_caps).map(|i| embed(i + num_tools)).collect();

    let incidence: Vec<Vec<usize>> = (0..num_caps)
        .map(|i| (0..4).map(|j| (i * 3 + j) % num_tools).collect())
        .collect();
    let cooccurrence: Vec<CooccurrenceEdge> = (0..num_tools)
        .map(|i| CooccurrenceEdge {
            from: i,
            to: (i + 1) % num_tools,
            weight: 0.5,
        })
        .collect();

    GraphView::assemble(
        DIM,
        tool_ids,
        tool_embeddings,
        vec![0.7; num_tools],
        cap_ids,
        vec![0; num_caps],
        cap_embeddings,
        vec![0.7; num_caps],
        incidence,
        vec![Vec::new(); num_caps],
        cooccurrence,
    )
}

fn bench_forward(c: &mut Criterion) {
    let view = synthetic_view(64, 32);
    let plan = adaptive_heads_by_graph_size(view.graph_size(), 0);
    let params = ShgatParams::init(DIM, 0, plan, 42);

    c.bench_function("forward_96_nodes", |b| {
        b.iter(|| {
            let propagated = MultiLevelOrchestrator::forward(&params, black_box(&view));
            black_box(propagated.e_final);
        })
    });
}

fn bench_scoring(c: &mut Criterion) {
    let view = synthetic_view(64, 32);
    let plan = adaptive_heads_by_graph_size(view.graph_size(), 0);
    let params = ShgatParams::init(DIM, 0, plan, 42);
    let propagated = MultiLevelOrchestrator::forward(&params, &view);
    let intent = vec![0.1f32; DIM];
    let candidates: Vec<usize> = (0..32).collect();

    c.bench_function("score_32_candidates", |b| {
        b.iter(|| {
            let scored = score_candidates(
                &params,
                propagated.e_final.view(),
                black_box(&intent),
                &candidates,
            )
            .unwrap();
            black_box(scored);
        })
    });
}

criterion_group!(benches, bench_forward, bench_scoring);
criterion_main!(benches);
