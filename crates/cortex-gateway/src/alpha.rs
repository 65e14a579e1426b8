//! Local adaptive fusion weights.
//!
//! Per (capability, mode) α values nudged by observed execution outcomes:
//! successes shift trust toward the graph signal, failures back toward
//! semantics. Entries absent from the table fall back to the mode default.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::decision::SearchMode;

const ALPHA_MIN: f32 = 0.1;
const ALPHA_MAX: f32 = 0.9;
const ALPHA_STEP: f32 = 0.05;

/// Per-node, per-mode fusion weight table.
#[derive(Default)]
pub struct AlphaTable {
    weights: RwLock<HashMap<(String, SearchMode), f32>>,
}

impl AlphaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local α if learned, else the mode default.
    pub fn alpha_for(&self, capability: &str, mode: SearchMode) -> f32 {
        self.weights
            .read()
            .get(&(capability.to_string(), mode))
            .copied()
            .unwrap_or_else(|| mode.default_alpha())
    }

    /// Nudges the local weight by one step: success lowers α (trust the
    /// graph more), failure raises it. Clamped to [0.1, 0.9].
    pub fn record_outcome(&self, capability: &str, mode: SearchMode, success: bool) {
        let mut weights = self.weights.write();
        let entry = weights
            .entry((capability.to_string(), mode))
            .or_insert_with(|| mode.default_alpha());
        let step = if success { -ALPHA_STEP } else { ALPHA_STEP };
        *entry = (*entry + step).clamp(ALPHA_MIN, ALPHA_MAX);
    }
}
