//! Pure training kernel and its stdio wire format.
//!
//! The parent writes one JSON document to the child's stdin and reads one
//! back from its stdout; stderr is free-form logging. The kernel itself is
//! a pure function over that input, so it is exercised directly by tests
//! and wrapped by the `cortex-train-kernel` binary.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use cortex_shgat::linalg::seeded_rng;
use cortex_shgat::{
    adaptive_heads_by_graph_size, info_nce_backward, train_epoch_flat, ContrastiveExample,
    ShgatParams, TrainOptions,
};

/// Capability row shipped to the kernel: identity, frozen embedding, and
/// the current success rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCapability {
    pub id: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub success_rate: f32,
}

/// One training example in wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelExample {
    pub trace_id: Uuid,
    pub intent_embedding: Vec<f32>,
    pub positive_id: String,
    pub negative_ids: Vec<String>,
}

/// Kernel hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelConfig {
    pub epochs: usize,
    pub batch_size: usize,
    #[serde(default = "default_lr")]
    pub learning_rate: f32,
    #[serde(default = "default_tau")]
    pub tau: f32,
    /// Seed for example shuffling; defaults to a fixed value so kernel runs
    /// are reproducible given identical input.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_lr() -> f32 {
    0.01
}

fn default_tau() -> f32 {
    0.1
}

fn default_seed() -> u64 {
    0x5eed
}

/// Input document: capabilities view, examples, config, and optionally the
/// parent's current parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInput {
    pub capabilities: Vec<KernelCapability>,
    pub examples: Vec<KernelExample>,
    pub config: KernelConfig,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub existing_params: Option<serde_json::Value>,
}

/// Output document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelOutput {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_loss: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_accuracy: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<serde_json::Value>,
    /// One entry per input example, in input order; examples skipped for
    /// unknown capability ids report a zero TD error.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub td_errors: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub grad_norm: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl KernelOutput {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            final_loss: None,
            final_accuracy: None,
            params: None,
            td_errors: None,
            grad_norm: None,
            error: Some(error.into()),
        }
    }
}

/// Runs the full training kernel: `epochs` passes of mini-batch InfoNCE SGD
/// over the capabilities view, returning refreshed parameters and TD errors.
pub fn run_training(input: KernelInput) -> KernelOutput {
    if input.capabilities.is_empty() {
        return KernelOutput::failure("empty capabilities view");
    }
    let dim = input.capabilities[0].embedding.len();
    if input
        .capabilities
        .iter()
        .any(|cap| cap.embedding.len() != dim)
    {
        return KernelOutput::failure("inconsistent capability embedding dimensions");
    }

    let mut embeddings = Array2::<f32>::zeros((input.capabilities.len(), dim));
    let mut row_of = std::collections::HashMap::new();
    for (row, cap) in input.capabilities.iter().enumerate() {
        for (c, value) in cap.embedding.iter().enumerate() {
            embeddings[[row, c]] = *value;
        }
        row_of.insert(cap.id.as_str(), row);
    }

    // Map wire examples onto embedding rows; unknown ids (retired
    // capabilities) are skipped rather than guessed at.
    let mut examples = Vec::with_capacity(input.examples.len());
    let mut example_slots = Vec::with_capacity(input.examples.len());
    for (slot, example) in input.examples.iter().enumerate() {
        if example.intent_embedding.len() != dim {
            return KernelOutput::failure(format!(
                "intent dimension {} does not match capability dimension {dim}",
                example.intent_embedding.len()
            ));
        }
        let Some(positive) = row_of.get(example.positive_id.as_str()).copied() else {
            warn!(positive = %example.positive_id, "unknown positive capability, example skipped");
            continue;
        };
        let negatives: Vec<usize> = example
            .negative_ids
            .iter()
            .filter_map(|id| row_of.get(id.as_str()).copied())
            .filter(|row| *row != positive)
            .collect();
        if negatives.is_empty() {
            warn!(positive = %example.positive_id, "no usable negatives, example skipped");
            continue;
        }
        examples.push(ContrastiveExample {
            intent: example.intent_embedding.clone(),
            positive,
            negatives,
        });
        example_slots.push(slot);
    }

    if examples.is_empty() {
        return KernelOutput::failure("no trainable examples");
    }

    let mut params = match input.existing_params {
        Some(blob) => match ShgatParams::import(blob) {
            Ok(params) if params.embedding_dim == dim => params,
            Ok(params) => {
                return KernelOutput::failure(format!(
                    "parameter dimension {} does not match view dimension {dim}",
                    params.embedding_dim
                ));
            }
            Err(err) => return KernelOutput::failure(format!("parameter import: {err}")),
        },
        None => {
            let plan = adaptive_heads_by_graph_size(input.capabilities.len(), 0);
            ShgatParams::init(dim, 0, plan, input.config.seed)
        }
    };

    let options = TrainOptions {
        learning_rate: input.config.learning_rate,
        tau: input.config.tau,
        batch_size: input.config.batch_size,
    };
    let mut rng = seeded_rng(input.config.seed);

    let mut final_stats = None;
    for epoch in 0..input.config.epochs.max(1) {
        match train_epoch_flat(&mut params, embeddings.view(), &examples, &options, &mut rng) {
            Ok(stats) => {
                debug!(
                    epoch,
                    loss = stats.mean_loss,
                    accuracy = stats.accuracy,
                    "kernel epoch complete"
                );
                final_stats = Some(stats);
            }
            Err(err) => return KernelOutput::failure(format!("epoch {epoch}: {err}")),
        }
    }

    // TD errors from a final evaluation pass under the trained parameters.
    let evaluation = match info_nce_backward(&params, embeddings.view(), &examples, options.tau) {
        Ok(evaluation) => evaluation,
        Err(err) => return KernelOutput::failure(format!("final evaluation: {err}")),
    };
    let mut td_errors = vec![0.0f32; input.examples.len()];
    for (slot, td) in example_slots.iter().zip(evaluation.td_errors.iter()) {
        td_errors[*slot] = *td;
    }

    let params_blob = match params.export() {
        Ok(blob) => blob,
        Err(err) => return KernelOutput::failure(format!("parameter export: {err}")),
    };

    let stats = final_stats.unwrap_or_default();
    KernelOutput {
        success: true,
        final_loss: Some(evaluation.loss),
        final_accuracy: Some(evaluation.accuracy),
        params: Some(params_blob),
        td_errors: Some(td_errors),
        grad_norm: Some(stats.grad_norm),
        error: None,
    }
}
