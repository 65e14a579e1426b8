//! End-to-end tests of the subprocess training driver against the real
//! `cortex-train-kernel` binary.

use std::path::PathBuf;
use std::sync::Arc;

use cortex_config::RuntimeConfig;
use cortex_hypergraph::{Embedding, HashedMockProvider, HypergraphStore};
use cortex_replay::{
    Outcome, PerTrainer, ReplayError, Trace, TraceKind, TraceStore, TrainOutcome,
};
use cortex_shgat::ShgatModel;

const DIM: usize = 8;

fn kernel_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cortex-train-kernel"))
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        embedding_dim: DIM,
        max_level: 0,
        num_negatives: 2,
        train_batch: 8,
        train_lr: 0.05,
        train_timeout_ms: 30_000,
        ..RuntimeConfig::default()
    }
}

fn unit(hot: usize) -> Embedding {
    let mut v = vec![0.0f32; DIM];
    v[hot % DIM] = 1.0;
    Embedding::from(v)
}

fn seeded_world(num_caps: usize, num_traces: usize) -> (Arc<TraceStore>, Arc<HypergraphStore>) {
    let graph = Arc::new(HypergraphStore::new(DIM, 0));
    for i in 0..num_caps {
        let tool = format!("tool-{i}");
        graph.upsert_tool(&tool, unit(i)).unwrap();
        graph
            .upsert_capability(&format!("cap-{i}"), 0, unit(i), &[], vec![tool])
            .unwrap();
    }

    let traces = Arc::new(TraceStore::with_seed(7, 42));
    for step in 0..num_traces {
        let cap = format!("cap-{}", step % num_caps);
        traces
            .append(Trace::new(TraceKind::CapabilityStart, &cap))
            .unwrap();
        traces
            .append(
                Trace::new(TraceKind::CapabilityEnd, &cap)
                    .with_capability(&cap)
                    .with_intent(format!("please run {cap}"))
                    .with_outcome(Outcome::Success, 10),
            )
            .unwrap();
    }
    (traces, graph)
}

fn trainer(
    traces: Arc<TraceStore>,
    graph: Arc<HypergraphStore>,
    model: Arc<ShgatModel>,
    kernel: PathBuf,
) -> PerTrainer {
    PerTrainer::new(
        traces,
        graph,
        model,
        Arc::new(HashedMockProvider::new(DIM)),
        config(),
        kernel,
    )
    .with_seed(11)
}

#[tokio::test]
async fn training_round_swaps_params_and_updates_priorities() {
    let (traces, graph) = seeded_world(4, 12);
    let model = Arc::new(ShgatModel::with_adaptive(DIM, 0, graph.graph_size(), 3));
    let before = serde_json::to_string(&model.export_params().unwrap()).unwrap();

    let trainer = trainer(traces.clone(), graph, model.clone(), kernel_bin());
    let outcome = trainer.train_incremental(50, 2).await.unwrap();

    let TrainOutcome::Completed(report) = outcome else {
        panic!("expected completed round, got {outcome:?}");
    };
    assert_eq!(report.trained_traces, 12);
    assert!(report.final_loss.is_finite());

    let after = serde_json::to_string(&model.export_params().unwrap()).unwrap();
    assert_ne!(before, after, "parameters were not swapped");

    // TD feedback reduced the trained traces below the untouched starts.
    let sample = traces.get_traces_by_priority(100);
    let trained_min = sample
        .iter()
        .filter(|t| t.kind == TraceKind::CapabilityEnd)
        .map(|t| t.priority)
        .fold(f32::INFINITY, f32::min);
    assert!(trained_min < 1.0);
}

#[tokio::test]
async fn no_traces_is_a_noop() {
    let (_, graph) = seeded_world(3, 0);
    let traces = Arc::new(TraceStore::with_seed(7, 1));
    let model = Arc::new(ShgatModel::with_adaptive(DIM, 0, graph.graph_size(), 3));
    let trainer = trainer(traces, graph, model, kernel_bin());

    let outcome = trainer.train_incremental(50, 1).await.unwrap();
    assert_eq!(outcome, TrainOutcome::NoTraces);
}

#[tokio::test]
async fn crashed_child_leaves_state_untouched() {
    let (traces, graph) = seeded_world(3, 6);
    let model = Arc::new(ShgatModel::with_adaptive(DIM, 0, graph.graph_size(), 3));
    let before = serde_json::to_string(&model.export_params().unwrap()).unwrap();
    let priorities_before: Vec<f32> = traces
        .get_traces_by_priority(100)
        .iter()
        .map(|t| t.priority)
        .collect();

    let trainer = trainer(
        traces.clone(),
        graph,
        model.clone(),
        PathBuf::from("/nonexistent/cortex-train-kernel"),
    );
    let err = trainer.train_incremental(50, 1).await.unwrap_err();
    assert!(matches!(err, ReplayError::TrainChildCrash(_)));

    let after = serde_json::to_string(&model.export_params().unwrap()).unwrap();
    assert_eq!(before, after, "params must stay untouched on crash");
    let priorities_after: Vec<f32> = traces
        .get_traces_by_priority(100)
        .iter()
        .map(|t| t.priority)
        .collect();
    assert_eq!(priorities_before.len(), priorities_after.len());
    assert!(priorities_after.iter().all(|p| *p == 1.0));
}

#[tokio::test]
async fn garbage_output_is_a_protocol_error() {
    let (traces, graph) = seeded_world(3, 6);
    let model = Arc::new(ShgatModel::with_adaptive(DIM, 0, graph.graph_size(), 3));

    // `cat` exits cleanly but echoes the input document, which is not a
    // kernel output.
    let trainer = trainer(traces, graph, model, PathBuf::from("cat"));
    let err = trainer.train_incremental(50, 1).await.unwrap_err();
    assert!(matches!(err, ReplayError::TrainProtocolError(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn hung_child_is_killed_on_timeout() {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!("cortex-kernel-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let script = dir.join("hang.sh");
    {
        let mut file = std::fs::File::create(&script).unwrap();
        file.write_all(b"#!/bin/sh\ncat > /dev/null\nsleep 30\n")
            .unwrap();
    }
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (traces, graph) = seeded_world(3, 6);
    let model = Arc::new(ShgatModel::with_adaptive(DIM, 0, graph.graph_size(), 3));
    let mut cfg = config();
    cfg.train_timeout_ms = 500;

    let trainer = PerTrainer::new(
        traces,
        graph,
        model,
        Arc::new(HashedMockProvider::new(DIM)),
        cfg,
        script.clone(),
    );

    let err = trainer.train_incremental(50, 1).await.unwrap_err();
    assert!(matches!(err, ReplayError::TrainTimeout(500)));

    std::fs::remove_dir_all(&dir).ok();
}

#[cfg(unix)]
#[tokio::test]
async fn concurrent_request_is_dropped_while_busy() {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!("cortex-busy-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let script = dir.join("slow.sh");
    {
        let mut file = std::fs::File::create(&script).unwrap();
        file.write_all(b"#!/bin/sh\ncat > /dev/null\nsleep 5\n").unwrap();
    }
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (traces, graph) = seeded_world(3, 6);
    let model = Arc::new(ShgatModel::with_adaptive(DIM, 0, graph.graph_size(), 3));
    let mut cfg = config();
    cfg.train_timeout_ms = 2_000;

    let trainer = Arc::new(PerTrainer::new(
        traces,
        graph,
        model,
        Arc::new(HashedMockProvider::new(DIM)),
        cfg,
        script.clone(),
    ));

    let busy = trainer.clone();
    let first = tokio::spawn(async move { busy.train_incremental(50, 1).await });
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let outcome = trainer.train_incremental(50, 1).await.unwrap();
    assert_eq!(outcome, TrainOutcome::Dropped);

    // The in-flight round times out against the hung script.
    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, ReplayError::TrainTimeout(_)));

    std::fs::remove_dir_all(&dir).ok();
}
