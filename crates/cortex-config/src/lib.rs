//! Cortex Configuration - Centralized runtime configuration
//!
//! Every tunable of the scoring and training runtime is read from the
//! environment exactly once at bootstrap and carried around as an injected
//! [`RuntimeConfig`] handle. No module-level mutable state.

use std::env;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Helper to read integer environment variables, falling back on parse errors.
fn usize_env(var: &str, default: usize) -> usize {
    match env::var(var) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var, raw = %raw, "invalid integer in environment, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Helper to read u64 environment variables.
fn u64_env(var: &str, default: u64) -> u64 {
    match env::var(var) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var, raw = %raw, "invalid integer in environment, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Helper to read float environment variables.
fn f32_env(var: &str, default: f32) -> f32 {
    match env::var(var) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var, raw = %raw, "invalid float in environment, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Embedding dimensionality shared by intents, tools, and capabilities.
///
/// Fixed at bootstrap; stores refuse vectors of any other dimension.
pub fn embedding_dim() -> usize {
    usize_env("EMBEDDING_DIM", 1024)
}

/// Maximum hyperedge composition level (level-0 edges are atomic bundles).
pub fn shgat_max_level() -> usize {
    usize_env("SHGAT_MAX_LEVEL", 2)
}

/// Prioritized-replay exponent: sampling priority is `|td|^alpha`.
pub fn per_alpha() -> f32 {
    f32_env("PER_ALPHA", 0.6)
}

/// InfoNCE softmax temperature.
pub fn per_tau() -> f32 {
    f32_env("PER_TAU", 0.1)
}

/// Random negatives drawn per training example.
pub fn num_negatives() -> usize {
    usize_env("NUM_NEGATIVES", 4)
}

/// SGD learning rate for the training kernel.
pub fn train_lr() -> f32 {
    f32_env("TRAIN_LR", 0.01)
}

/// Mini-batch size for the training kernel.
pub fn train_batch() -> usize {
    usize_env("TRAIN_BATCH", 16)
}

/// Wall-clock budget for one training subprocess, in milliseconds.
pub fn train_timeout_ms() -> u64 {
    u64_env("TRAIN_TIMEOUT_MS", 60_000)
}

/// Persisted parameters younger than this skip batch training at boot.
pub fn param_staleness_sec() -> u64 {
    u64_env("PARAM_STALENESS_SEC", 3600)
}

/// Trace retention window in days.
pub fn trace_retention_days() -> u64 {
    u64_env("TRACE_RETENTION_DAYS", 7)
}

/// Aggregated snapshot of every runtime tunable.
///
/// Constructed once at bootstrap and injected into the components that need
/// it, so tests can build arbitrary configurations without touching the
/// process environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub embedding_dim: usize,
    pub max_level: usize,
    pub per_alpha: f32,
    pub per_tau: f32,
    pub num_negatives: usize,
    pub train_lr: f32,
    pub train_batch: usize,
    pub train_timeout_ms: u64,
    pub param_staleness_sec: u64,
    pub trace_retention_days: u64,
}

impl RuntimeConfig {
    /// Reads the full configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            embedding_dim: embedding_dim(),
            max_level: shgat_max_level(),
            per_alpha: per_alpha(),
            per_tau: per_tau(),
            num_negatives: num_negatives(),
            train_lr: train_lr(),
            train_batch: train_batch(),
            train_timeout_ms: train_timeout_ms(),
            param_staleness_sec: param_staleness_sec(),
            trace_retention_days: trace_retention_days(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 1024,
            max_level: 2,
            per_alpha: 0.6,
            per_tau: 0.1,
            num_negatives: 4,
            train_lr: 0.01,
            train_batch: 16,
            train_timeout_ms: 60_000,
            param_staleness_sec: 3600,
            trace_retention_days: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.embedding_dim, 1024);
        assert_eq!(config.max_level, 2);
        assert_eq!(config.per_alpha, 0.6);
        assert_eq!(config.per_tau, 0.1);
        assert_eq!(config.num_negatives, 4);
        assert_eq!(config.train_lr, 0.01);
        assert_eq!(config.train_batch, 16);
        assert_eq!(config.train_timeout_ms, 60_000);
        assert_eq!(config.param_staleness_sec, 3600);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
