//! Prometheus metrics for the serving and training paths.

use once_cell::sync::Lazy;
use prometheus::{Counter, Histogram, HistogramOpts, Registry};

static DECISIONS_SERVED: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "cortex_decisions_served_total",
        "Total unified-search decisions served",
    )
    .unwrap()
});

static DECISIONS_REJECTED: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "cortex_decisions_rejected_total",
        "Decisions rejected at the threshold",
    )
    .unwrap()
});

static TRAINING_ROUNDS: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "cortex_training_rounds_total",
        "Completed training rounds",
    )
    .unwrap()
});

static TRAINING_FAILURES: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "cortex_training_failures_total",
        "Training rounds that errored or timed out",
    )
    .unwrap()
});

static SCORING_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "cortex_scoring_duration_seconds",
        "Unified-search latency",
    ))
    .unwrap()
});

/// Metrics registry wrapper.
pub struct GatewayMetrics {
    registry: Registry,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        registry.register(Box::new(DECISIONS_SERVED.clone())).unwrap();
        registry
            .register(Box::new(DECISIONS_REJECTED.clone()))
            .unwrap();
        registry.register(Box::new(TRAINING_ROUNDS.clone())).unwrap();
        registry
            .register(Box::new(TRAINING_FAILURES.clone()))
            .unwrap();
        registry.register(Box::new(SCORING_DURATION.clone())).unwrap();
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn inc_served() {
        DECISIONS_SERVED.inc();
    }

    pub fn inc_rejected() {
        DECISIONS_REJECTED.inc();
    }

    pub fn inc_training_round() {
        TRAINING_ROUNDS.inc();
    }

    pub fn inc_training_failure() {
        TRAINING_FAILURES.inc();
    }

    pub fn observe_scoring_duration(seconds: f64) {
        SCORING_DURATION.observe(seconds);
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
