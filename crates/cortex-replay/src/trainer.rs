//! Subprocess-based PER training driver.
//!
//! At most one training child runs at a time (single-slot; a busy slot
//! drops the request and the next trace tick retries). The child gets one
//! JSON document on stdin and answers with one on stdout; stdout and stderr
//! are drained by independent tasks, because sequential reads deadlock on
//! the pipe buffer for medium payloads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use cortex_config::RuntimeConfig;
use cortex_hypergraph::{EmbeddingProvider, HypergraphStore};
use cortex_shgat::{sample_negatives, ShgatModel};

use crate::error::{ReplayError, Result};
use crate::kernel::{KernelCapability, KernelConfig, KernelExample, KernelInput, KernelOutput};
use crate::store::TraceStore;

/// Batch (startup) profile: several epochs over a deep sample.
pub const BATCH_EPOCHS: usize = 3;
pub const BATCH_MAX_TRACES: usize = 500;

/// Live (post-execution) profile: one cheap pass over recent experience.
pub const LIVE_EPOCHS: usize = 1;
pub const LIVE_MAX_TRACES: usize = 50;

/// Outcome of one `train_incremental` call.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    /// Training ran and the parameters were swapped in.
    Completed(TrainReport),
    /// Another training round was in flight; this request was dropped.
    Dropped,
    /// No trainable traces were available.
    NoTraces,
}

/// Statistics of a completed round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainReport {
    pub trained_traces: usize,
    pub final_loss: f32,
    pub final_accuracy: f32,
    pub grad_norm: f32,
}

/// PER trainer: samples traces, builds contrastive batches, and drives the
/// training kernel subprocess.
pub struct PerTrainer {
    traces: Arc<TraceStore>,
    graph: Arc<HypergraphStore>,
    model: Arc<ShgatModel>,
    provider: Arc<dyn EmbeddingProvider>,
    config: RuntimeConfig,
    kernel_bin: PathBuf,
    /// Single training slot; `try_lock` failure means busy → drop.
    slot: tokio::sync::Mutex<()>,
    intent_cache: Mutex<HashMap<String, Vec<f32>>>,
    rng: Mutex<StdRng>,
}

impl PerTrainer {
    pub fn new(
        traces: Arc<TraceStore>,
        graph: Arc<HypergraphStore>,
        model: Arc<ShgatModel>,
        provider: Arc<dyn EmbeddingProvider>,
        config: RuntimeConfig,
        kernel_bin: PathBuf,
    ) -> Self {
        Self {
            traces,
            graph,
            model,
            provider,
            config,
            kernel_bin,
            slot: tokio::sync::Mutex::new(()),
            intent_cache: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fixes the negative-sampling seed for reproducible tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Startup profile.
    pub async fn train_batch(&self) -> Result<TrainOutcome> {
        self.train_incremental(BATCH_MAX_TRACES, BATCH_EPOCHS).await
    }

    /// Post-execution profile.
    pub async fn train_live(&self) -> Result<TrainOutcome> {
        self.train_incremental(LIVE_MAX_TRACES, LIVE_EPOCHS).await
    }

    /// One training round over up to `max_traces` highest-priority traces.
    ///
    /// Non-fatal by contract: on any error the traces stay unconsumed, the
    /// priorities unchanged, and the live parameters untouched.
    #[instrument(name = "trainer.train_incremental", skip(self))]
    pub async fn train_incremental(&self, max_traces: usize, epochs: usize) -> Result<TrainOutcome> {
        let Ok(_slot) = self.slot.try_lock() else {
            debug!("training slot busy, request dropped");
            return Ok(TrainOutcome::Dropped);
        };

        let (input, trace_ids) = match self.build_input(max_traces, epochs).await? {
            Some(built) => built,
            None => return Ok(TrainOutcome::NoTraces),
        };

        let output = self.run_kernel(&input).await?;
        if !output.success {
            return Err(ReplayError::TrainProtocolError(
                output.error.unwrap_or_else(|| "kernel reported failure".into()),
            ));
        }
        let params = output
            .params
            .ok_or_else(|| ReplayError::TrainProtocolError("missing params in output".into()))?;
        let td_errors = output
            .td_errors
            .ok_or_else(|| ReplayError::TrainProtocolError("missing tdErrors in output".into()))?;
        if td_errors.len() != trace_ids.len() {
            return Err(ReplayError::TrainProtocolError(format!(
                "{} tdErrors for {} traces",
                td_errors.len(),
                trace_ids.len()
            )));
        }

        // Import first: the swapped parameters are what the TD feedback was
        // measured against.
        self.model.import_params(params)?;
        self.traces
            .update_priorities(&trace_ids, &td_errors, self.config.per_alpha);

        let report = TrainReport {
            trained_traces: trace_ids.len(),
            final_loss: output.final_loss.unwrap_or(0.0),
            final_accuracy: output.final_accuracy.unwrap_or(0.0),
            grad_norm: output.grad_norm.unwrap_or(0.0),
        };
        info!(
            traces = report.trained_traces,
            loss = report.final_loss,
            accuracy = report.final_accuracy,
            "training round complete"
        );
        Ok(TrainOutcome::Completed(report))
    }

    /// Samples traces and assembles the kernel input document. Traces whose
    /// capability has been retired from the graph are skipped; their
    /// priorities stay untouched.
    async fn build_input(
        &self,
        max_traces: usize,
        epochs: usize,
    ) -> Result<Option<(KernelInput, Vec<Uuid>)>> {
        let sampled = self.traces.get_traces_by_priority(max_traces);
        if sampled.is_empty() {
            return Ok(None);
        }

        let view = self.graph.view();
        if view.cap_ids.is_empty() {
            return Ok(None);
        }
        let capabilities: Vec<KernelCapability> = view
            .cap_ids
            .iter()
            .enumerate()
            .map(|(flat, id)| KernelCapability {
                id: id.clone(),
                embedding: view.cap_embeddings[flat].clone(),
                success_rate: view.cap_success[flat],
            })
            .collect();

        let mut examples = Vec::new();
        let mut trace_ids = Vec::new();
        for trace in sampled {
            if !trace.is_trainable() {
                continue;
            }
            let capability_id = trace.capability_id.clone().unwrap_or_default();
            let Some(positive_flat) = view.cap_index_of(&capability_id) else {
                debug!(capability = %capability_id, "capability retired, trace skipped");
                continue;
            };
            let intent_text = trace.intent_text.clone().unwrap_or_default();
            let intent_embedding = self.intent_embedding(&intent_text).await?;

            let negatives = {
                let mut rng = self.rng.lock();
                sample_negatives(
                    view.cap_ids.len(),
                    positive_flat,
                    self.config.num_negatives,
                    &mut *rng,
                )
            };
            let negative_ids: Vec<String> = negatives
                .into_iter()
                .map(|flat| view.cap_ids[flat].clone())
                .collect();

            examples.push(KernelExample {
                trace_id: trace.trace_id,
                intent_embedding,
                positive_id: capability_id,
                negative_ids,
            });
            trace_ids.push(trace.trace_id);
        }

        if examples.is_empty() {
            return Ok(None);
        }

        let input = KernelInput {
            capabilities,
            examples,
            config: KernelConfig {
                epochs,
                batch_size: self.config.train_batch,
                learning_rate: self.config.train_lr,
                tau: self.config.per_tau,
                seed: 0x5eed,
            },
            existing_params: self.model.export_params().ok(),
        };
        Ok(Some((input, trace_ids)))
    }

    /// Intent embeddings are cached per text: replayed traces re-use the
    /// vector instead of re-encoding.
    async fn intent_embedding(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.intent_cache.lock().get(text).cloned() {
            return Ok(cached);
        }
        let embedding = self.provider.encode(text).await?;
        let vector: Vec<f32> = embedding.into();
        self.intent_cache
            .lock()
            .insert(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Spawns the kernel child and speaks the stdio protocol, under the
    /// configured wall-clock budget.
    async fn run_kernel(&self, input: &KernelInput) -> Result<KernelOutput> {
        let payload = serde_json::to_vec(input)?;
        let budget = Duration::from_millis(self.config.train_timeout_ms);

        let mut child = Command::new(&self.kernel_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ReplayError::TrainChildCrash(format!("spawn: {err}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ReplayError::TrainChildCrash("stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReplayError::TrainChildCrash("stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ReplayError::TrainChildCrash("stderr unavailable".into()))?;

        // Independent readers per pipe; reading them sequentially deadlocks
        // once either buffer fills.
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "train_kernel", "{line}");
            }
        });
        let stdout_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            stdout.read_to_end(&mut buffer).await.map(|_| buffer)
        });

        let protocol = async {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
            drop(stdin);

            let status = child.wait().await?;
            let buffer = stdout_task
                .await
                .map_err(|err| std::io::Error::other(format!("stdout reader: {err}")))??;
            Ok::<_, std::io::Error>((status, buffer))
        };

        let (status, buffer) = match timeout(budget, protocol).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                stderr_task.abort();
                return Err(ReplayError::TrainChildCrash(err.to_string()));
            }
            Err(_) => {
                warn!(budget_ms = self.config.train_timeout_ms, "training timed out, killing child");
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(ReplayError::TrainTimeout(self.config.train_timeout_ms));
            }
        };
        let _ = stderr_task.await;

        if !status.success() {
            return Err(ReplayError::TrainChildCrash(format!(
                "exit status {status}"
            )));
        }
        let output: KernelOutput = serde_json::from_slice(&buffer)
            .map_err(|err| ReplayError::TrainProtocolError(format!("malformed output: {err}")))?;
        Ok(output)
    }
}
