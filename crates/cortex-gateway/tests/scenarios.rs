//! End-to-end gateway scenarios: cold start, convergence, staleness gate,
//! reliability veto, parameter round trips, and scoring under concurrent
//! parameter swaps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use cortex_config::RuntimeConfig;
use cortex_gateway::{
    Decision, Gateway, InMemoryDecisionSink, InMemoryParamStore, NoopDecisionLogger, ParamRecord,
    ParamStore, SearchMode, SearchRequest, StartupTraining, TelemetryDecisionLogger,
};
use cortex_hypergraph::{Embedding, EmbeddingError, EmbeddingProvider};
use cortex_replay::kernel::{run_training, KernelCapability, KernelConfig, KernelExample, KernelInput};
use cortex_replay::{Outcome, Trace, TraceKind};
use cortex_shgat::PARAM_SCHEMA_VERSION;
use uuid::Uuid;

const DIM: usize = 16;

/// Test provider with pinned vectors per text and a deterministic fallback.
struct StubProvider {
    pinned: HashMap<String, Vec<f32>>,
}

impl StubProvider {
    fn new(pinned: Vec<(&str, Vec<f32>)>) -> Self {
        Self {
            pinned: pinned
                .into_iter()
                .map(|(text, v)| (text.to_string(), v))
                .collect(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
    async fn encode(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if let Some(vector) = self.pinned.get(text) {
            return Ok(Embedding::from(vector.clone()).normalized());
        }
        let mut v = vec![0.0f32; DIM];
        let mut acc = 17u64;
        for byte in text.bytes() {
            acc = acc.wrapping_mul(31).wrapping_add(byte as u64);
        }
        for (i, value) in v.iter_mut().enumerate() {
            acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i as u64);
            *value = ((acc >> 33) as f32 / (1u64 << 31) as f32) - 0.5;
        }
        Ok(Embedding::from(v).normalized())
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> &str {
        "stub-provider"
    }
}

fn axis(hot: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[hot] = 1.0;
    v
}

fn blend(a: usize, wa: f32, b: usize, wb: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[a] = wa;
    v[b] = wb;
    v
}

fn gateway_with(provider: StubProvider) -> Gateway {
    let config = RuntimeConfig {
        embedding_dim: DIM,
        max_level: 2,
        ..RuntimeConfig::default()
    };
    Gateway::bootstrap(
        config,
        Arc::new(provider),
        Arc::new(NoopDecisionLogger),
        Arc::new(InMemoryParamStore::new()),
        PathBuf::from("/nonexistent/kernel"),
        "test-user",
    )
    .unwrap()
    .without_live_training()
}

#[tokio::test]
async fn bootstrap_rejects_dimension_mismatch() {
    let config = RuntimeConfig {
        embedding_dim: 32,
        ..RuntimeConfig::default()
    };
    let result = Gateway::bootstrap(
        config,
        Arc::new(StubProvider::new(Vec::new())),
        Arc::new(NoopDecisionLogger),
        Arc::new(InMemoryParamStore::new()),
        PathBuf::from("/nonexistent/kernel"),
        "u",
    );
    assert!(result.is_err());
}

/// Cold start: two atomic capabilities, intent aligned with the larger one.
#[tokio::test]
async fn cold_start_ranks_aligned_capability_first() {
    let provider = StubProvider::new(vec![("summarize the document", axis(0))]);
    let gateway = gateway_with(provider);

    let graph = gateway.graph();
    graph
        .upsert_tool("read", Embedding::from(axis(4)).normalized())
        .unwrap();
    graph
        .upsert_tool("parse", Embedding::from(axis(5)).normalized())
        .unwrap();
    graph
        .upsert_capability(
            "c1",
            0,
            Embedding::from(blend(0, 0.8, 1, 0.6)).normalized(),
            &[],
            vec!["read".into()],
        )
        .unwrap();
    graph
        .upsert_capability(
            "c2",
            0,
            Embedding::from(axis(0)).normalized(),
            &[],
            vec!["read".into(), "parse".into()],
        )
        .unwrap();

    let ranked = gateway
        .unified_search(&SearchRequest {
            intent: "summarize the document".into(),
            context_tools: Vec::new(),
            mode: SearchMode::ActiveSearch,
            top_k: 1,
            min_score: 0.1,
        })
        .await
        .unwrap();

    assert_eq!(ranked.len(), 1);
    let top = &ranked[0];
    assert_eq!(top.cap_id, "c2");
    assert!(top.semantic > 0.99, "semantic {}", top.semantic);
    assert_eq!(top.alpha, 0.7);
    assert_eq!(top.reliability, 1.0);
    assert_eq!(top.decision, Decision::Accepted);
    // Untrained graph score hovers near the sigmoid midpoint.
    assert!(top.graph > 0.3 && top.graph < 0.7);
}

/// Reliability veto: a low-success capability is crushed below the
/// threshold no matter how well it matches.
#[tokio::test]
async fn reliability_veto_rejects_unreliable_capability() {
    let provider = StubProvider::new(vec![("send the weekly report", axis(0))]);
    let gateway = gateway_with(provider);
    let graph = gateway.graph();

    graph
        .upsert_tool("mail", Embedding::from(axis(7)).normalized())
        .unwrap();
    graph
        .upsert_capability(
            "c3",
            0,
            Embedding::from(axis(0)).normalized(),
            &[],
            vec!["mail".into()],
        )
        .unwrap();

    // Drive the success rate to ~0.3.
    for success in [true, false, false, true, false, false, false, true] {
        graph.record_outcome("c3", success).unwrap();
    }
    let rate = graph.capability("c3").unwrap().success.rate();
    assert!(rate < 0.5, "rate {rate}");

    let ranked = gateway
        .unified_search(&SearchRequest {
            intent: "send the weekly report".into(),
            context_tools: Vec::new(),
            mode: SearchMode::PassiveSuggestion,
            top_k: 1,
            min_score: 0.2,
        })
        .await
        .unwrap();

    let top = &ranked[0];
    assert_eq!(top.cap_id, "c3");
    assert!(top.semantic > 0.99);
    assert_eq!(top.reliability, 0.1);
    assert!(top.final_score < 0.2, "final {}", top.final_score);
    assert_eq!(top.decision, Decision::Rejected);
}

/// Training converges: 50 traces preferring c1 reshape the graph signal.
#[tokio::test]
async fn training_separates_preferred_capability() {
    let intent_text = "fetch the quarterly numbers";
    let provider = StubProvider::new(vec![(intent_text, axis(0))]);
    let gateway = gateway_with(provider);
    let graph = gateway.graph();

    graph
        .upsert_tool("db.query", Embedding::from(axis(6)).normalized())
        .unwrap();
    let c1_embedding = Embedding::from(blend(0, 0.8, 1, 0.6)).normalized();
    let c2_embedding = Embedding::from(blend(0, 0.4, 2, 0.9165)).normalized();
    graph
        .upsert_capability("c1", 0, c1_embedding.clone(), &[], vec!["db.query".into()])
        .unwrap();
    graph
        .upsert_capability("c2", 0, c2_embedding.clone(), &[], vec!["db.query".into()])
        .unwrap();

    // 50 executions, every one selecting c1 for this intent family.
    let intent_vec: Vec<f32> = Embedding::from(axis(0)).normalized().into();
    let examples: Vec<KernelExample> = (0..50)
        .map(|_| KernelExample {
            trace_id: Uuid::new_v4(),
            intent_embedding: intent_vec.clone(),
            positive_id: "c1".into(),
            negative_ids: vec!["c2".into()],
        })
        .collect();
    let input = KernelInput {
        capabilities: vec![
            KernelCapability {
                id: "c1".into(),
                embedding: c1_embedding.clone().into(),
                success_rate: 0.8,
            },
            KernelCapability {
                id: "c2".into(),
                embedding: c2_embedding.clone().into(),
                success_rate: 0.8,
            },
        ],
        examples,
        config: KernelConfig {
            epochs: 5,
            batch_size: 16,
            learning_rate: 0.1,
            tau: 0.1,
            seed: 3,
        },
        existing_params: Some(gateway.export_params().unwrap()),
    };

    let output = run_training(input);
    assert!(output.success, "{:?}", output.error);
    gateway.import_params(output.params.unwrap()).await.unwrap();

    let ranked = gateway
        .unified_search(&SearchRequest {
            intent: intent_text.into(),
            context_tools: Vec::new(),
            mode: SearchMode::PassiveSuggestion,
            top_k: 2,
            min_score: 0.1,
        })
        .await
        .unwrap();

    let by_id: HashMap<&str, f32> = ranked
        .iter()
        .map(|c| (c.cap_id.as_str(), c.final_score))
        .collect();
    assert!(by_id["c1"] > 0.6, "c1 final {}", by_id["c1"]);
    assert!(by_id["c2"] < 0.4, "c2 final {}", by_id["c2"]);
}

/// Fresh persisted params skip batch training at startup.
#[tokio::test]
async fn startup_skips_batch_training_when_params_fresh() {
    let provider = StubProvider::new(Vec::new());
    let config = RuntimeConfig {
        embedding_dim: DIM,
        ..RuntimeConfig::default()
    };
    let params_store = Arc::new(InMemoryParamStore::new());

    let gateway = Gateway::bootstrap(
        config,
        Arc::new(provider),
        Arc::new(NoopDecisionLogger),
        params_store.clone(),
        PathBuf::from("/nonexistent/kernel"),
        "test-user",
    )
    .unwrap()
    .without_live_training();

    // Persist the current params, stamped ten minutes ago.
    params_store
        .save(
            "test-user",
            ParamRecord {
                params_json: gateway.export_params().unwrap(),
                updated_at: Utc::now() - Duration::minutes(10),
                schema_version: PARAM_SCHEMA_VERSION,
            },
        )
        .await
        .unwrap();

    let outcome = gateway.startup_training().await.unwrap();
    match outcome {
        StartupTraining::SkippedFresh { age_seconds } => {
            assert!((595..=605).contains(&age_seconds));
        }
        other => panic!("expected fresh skip, got {other:?}"),
    }
}

/// Stale (or absent) persisted params fall through to batch training, which
/// is a no-op on an empty trace store.
#[tokio::test]
async fn startup_with_stale_params_and_no_traces_is_noop() {
    let provider = StubProvider::new(Vec::new());
    let params_store = Arc::new(InMemoryParamStore::new());
    let config = RuntimeConfig {
        embedding_dim: DIM,
        ..RuntimeConfig::default()
    };
    let gateway = Gateway::bootstrap(
        config,
        Arc::new(provider),
        Arc::new(NoopDecisionLogger),
        params_store.clone(),
        PathBuf::from("/nonexistent/kernel"),
        "test-user",
    )
    .unwrap()
    .without_live_training();

    params_store
        .save(
            "test-user",
            ParamRecord {
                params_json: gateway.export_params().unwrap(),
                updated_at: Utc::now() - Duration::hours(5),
                schema_version: PARAM_SCHEMA_VERSION,
            },
        )
        .await
        .unwrap();

    let outcome = gateway.startup_training().await.unwrap();
    assert_eq!(outcome, StartupTraining::NoTraces);
}

/// Params round-trip: identical JSON and bit-exact inference.
#[tokio::test]
async fn param_round_trip_is_identity() {
    let provider = StubProvider::new(vec![("locate the settings", axis(3))]);
    let gateway = gateway_with(provider);
    let graph = gateway.graph();
    graph
        .upsert_tool("find", Embedding::from(axis(9)).normalized())
        .unwrap();
    graph
        .upsert_capability(
            "cap",
            0,
            Embedding::from(axis(3)).normalized(),
            &[],
            vec!["find".into()],
        )
        .unwrap();

    let request = SearchRequest {
        intent: "locate the settings".into(),
        context_tools: Vec::new(),
        mode: SearchMode::ActiveSearch,
        top_k: 1,
        min_score: 0.0,
    };

    let exported = gateway.export_params().unwrap();
    let before = gateway.unified_search(&request).await.unwrap();

    gateway.import_params(exported.clone()).await.unwrap();
    let re_exported = gateway.export_params().unwrap();
    let after = gateway.unified_search(&request).await.unwrap();

    assert_eq!(
        serde_json::to_string(&exported).unwrap(),
        serde_json::to_string(&re_exported).unwrap()
    );
    assert_eq!(before[0].final_score.to_bits(), after[0].final_score.to_bits());
    assert_eq!(before[0].graph.to_bits(), after[0].graph.to_bits());
}

/// Concurrent searches during parameter swaps observe one coherent set:
/// every result matches the scores of exactly one version.
#[tokio::test]
async fn concurrent_searches_see_coherent_param_versions() {
    let provider = StubProvider::new(vec![("resolve the hostname", axis(2))]);
    let gateway = Arc::new(gateway_with(provider));
    let graph = gateway.graph();
    graph
        .upsert_tool("dns", Embedding::from(axis(11)).normalized())
        .unwrap();
    for cap in ["net.lookup", "net.ping"] {
        graph
            .upsert_capability(
                cap,
                0,
                Embedding::from(blend(2, 0.9, 12, 0.436)).normalized(),
                &[],
                vec!["dns".into()],
            )
            .unwrap();
    }

    let request = SearchRequest {
        intent: "resolve the hostname".into(),
        context_tools: Vec::new(),
        mode: SearchMode::ActiveSearch,
        top_k: 2,
        min_score: 0.0,
    };

    // Two parameter versions: the bootstrap set and a reseeded set.
    let version_a = gateway.export_params().unwrap();
    let reseeded = cortex_shgat::ShgatModel::with_adaptive(DIM, 2, graph.graph_size(), 999);
    let version_b = reseeded.export_params().unwrap();

    let score_under = |blob: serde_json::Value| {
        let gateway = gateway.clone();
        let request = request.clone();
        async move {
            gateway.import_params(blob).await.unwrap();
            gateway
                .unified_search(&request)
                .await
                .unwrap()
                .iter()
                .map(|c| c.graph.to_bits())
                .collect::<Vec<u32>>()
        }
    };
    let scores_a = score_under(version_a.clone()).await;
    let scores_b = score_under(version_b.clone()).await;
    assert_ne!(scores_a, scores_b);

    // Swapper task alternates versions while 100 searches run.
    let swapper = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            for round in 0..50 {
                let blob = if round % 2 == 0 {
                    version_a.clone()
                } else {
                    version_b.clone()
                };
                gateway.import_params(blob).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let searches: Vec<_> = (0..100)
        .map(|_| {
            let gateway = gateway.clone();
            let request = request.clone();
            tokio::spawn(async move {
                gateway
                    .unified_search(&request)
                    .await
                    .unwrap()
                    .iter()
                    .map(|c| c.graph.to_bits())
                    .collect::<Vec<u32>>()
            })
        })
        .collect();

    for handle in searches {
        let scores = handle.await.unwrap();
        assert!(
            scores == scores_a || scores == scores_b,
            "search observed a torn parameter set"
        );
    }
    swapper.await.unwrap();
}

/// The telemetry logger receives one defaulted record per served candidate.
#[tokio::test]
async fn decisions_are_logged_with_correlation_ids() {
    let provider = StubProvider::new(vec![("archive old logs", axis(5))]);
    let sink = Arc::new(InMemoryDecisionSink::new());
    let config = RuntimeConfig {
        embedding_dim: DIM,
        ..RuntimeConfig::default()
    };
    let gateway = Gateway::bootstrap(
        config,
        Arc::new(provider),
        Arc::new(TelemetryDecisionLogger::new(sink.clone())),
        Arc::new(InMemoryParamStore::new()),
        PathBuf::from("/nonexistent/kernel"),
        "test-user",
    )
    .unwrap()
    .without_live_training();

    let graph = gateway.graph();
    graph
        .upsert_tool("fs.archive", Embedding::from(axis(13)).normalized())
        .unwrap();
    graph
        .upsert_capability(
            "cap.archive",
            0,
            Embedding::from(axis(5)).normalized(),
            &[],
            vec!["fs.archive".into()],
        )
        .unwrap();

    gateway
        .unified_search(&SearchRequest {
            intent: "archive old logs".into(),
            context_tools: vec!["fs.archive".into()],
            mode: SearchMode::Speculation,
            top_k: 1,
            min_score: 0.1,
        })
        .await
        .unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.algorithm, "shgat-unified");
    assert!(record.correlation_id.is_some());
    assert!(record.signals["semantic"].as_f64().unwrap() > 0.9);
    assert_eq!(record.mode, SearchMode::Speculation);
}

/// Observed executions append traces and feed the graph (S3 is covered in
/// the ingestion tests; this exercises the gateway surface).
#[tokio::test]
async fn observe_execution_appends_and_builds_graph() {
    let provider = StubProvider::new(Vec::new());
    let gateway = gateway_with(provider);

    let batch = vec![
        Trace::new(TraceKind::CapabilityStart, "cap.sync"),
        Trace::new(TraceKind::CapabilityEnd, "cap.sync")
            .with_capability("cap.sync")
            .with_intent("synchronize the folder")
            .with_outcome(Outcome::Success, 20)
            .with_executed_path(vec!["fs.list".into(), "fs.copy".into()]),
    ];
    let report = gateway.observe_execution(batch).await.unwrap();

    assert_eq!(report.appended, 2);
    assert_eq!(report.tools_created, 2);
    assert_eq!(report.edges_asserted, 1);
    assert_eq!(gateway.traces().len(), 2);
    assert!(gateway.graph().tool("fs.list").is_some());
}
