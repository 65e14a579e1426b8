//! Append-only episodic trace store with a priority index.
//!
//! The index is an ordered map keyed by (priority bits, sequence), giving
//! O(log N) insertion and reverse iteration in descending priority order.
//! Ties are broken stochastically at query time so equally-surprising
//! traces rotate through the replay batches.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use cortex_shgat::linalg::fisher_yates;

use crate::error::{ReplayError, Result};
use crate::trace::{Trace, TraceKind};

/// Floor and ceiling of the replay priority range.
pub const PRIORITY_MIN: f32 = 1e-6;
pub const PRIORITY_MAX: f32 = 1.0;

/// Default grace period before an unmatched start trace is collected.
pub const UNMATCHED_START_TIMEOUT_MINUTES: i64 = 10;

type PriorityKey = (u32, u64);

fn priority_bits(priority: f32) -> u32 {
    // Priorities are clamped positive, so the IEEE bit pattern orders them.
    priority.clamp(PRIORITY_MIN, PRIORITY_MAX).to_bits()
}

#[derive(Default)]
struct TraceState {
    traces: HashMap<Uuid, Trace>,
    index: BTreeMap<PriorityKey, Uuid>,
    key_of: HashMap<Uuid, PriorityKey>,
    /// Open start spans per target id, oldest first.
    open_spans: HashMap<(TraceKind, String), Vec<Uuid>>,
    seq: u64,
}

/// Multi-reader/single-writer episodic trace store.
pub struct TraceStore {
    state: RwLock<TraceState>,
    rng: Mutex<StdRng>,
    retention: Duration,
    start_timeout: Duration,
}

impl TraceStore {
    /// Store with the given retention window in days.
    pub fn new(retention_days: u64) -> Self {
        Self::with_seed(retention_days, rand::random())
    }

    /// Deterministic store for tests.
    pub fn with_seed(retention_days: u64, seed: u64) -> Self {
        Self {
            state: RwLock::new(TraceState::default()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            retention: Duration::days(retention_days as i64),
            start_timeout: Duration::minutes(UNMATCHED_START_TIMEOUT_MINUTES),
        }
    }

    /// Number of retained traces.
    pub fn len(&self) -> usize {
        self.state.read().traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().traces.is_empty()
    }

    /// Appends one trace, enforcing the hierarchy and span invariants:
    /// a parent id must already be present, and an end event must close a
    /// previously appended start for the same target.
    #[instrument(name = "trace_store.append", skip_all, fields(kind = ?trace.kind, target = %trace.target_id))]
    pub fn append(&self, trace: Trace) -> Result<()> {
        let mut state = self.state.write();

        if let Some(parent) = trace.parent_trace_id {
            if !state.traces.contains_key(&parent) {
                warn!(%parent, "trace references unknown parent, rejected");
                return Err(ReplayError::InvalidTrace(format!(
                    "unknown parent trace {parent}"
                )));
            }
        }

        match trace.kind {
            TraceKind::ToolStart | TraceKind::CapabilityStart => {
                state
                    .open_spans
                    .entry((trace.kind, trace.target_id.clone()))
                    .or_default()
                    .push(trace.trace_id);
            }
            TraceKind::ToolEnd | TraceKind::CapabilityEnd => {
                let start_kind = match trace.kind {
                    TraceKind::ToolEnd => TraceKind::ToolStart,
                    _ => TraceKind::CapabilityStart,
                };
                let key = (start_kind, trace.target_id.clone());
                let closed = state
                    .open_spans
                    .get_mut(&key)
                    .and_then(|starts| starts.pop());
                if closed.is_none() {
                    warn!(target = %trace.target_id, "end trace without matching start, rejected");
                    return Err(ReplayError::InvalidTrace(format!(
                        "no open start for {}",
                        trace.target_id
                    )));
                }
            }
        }

        let seq = state.seq;
        state.seq += 1;
        let key = (priority_bits(trace.priority), seq);
        state.index.insert(key, trace.trace_id);
        state.key_of.insert(trace.trace_id, key);
        state.traces.insert(trace.trace_id, trace);
        Ok(())
    }

    /// Looks up one trace.
    pub fn get(&self, id: Uuid) -> Option<Trace> {
        self.state.read().traces.get(&id).cloned()
    }

    /// Top-`k` traces by descending priority, with a stochastic tie-break
    /// inside equal-priority runs. Operates on a snapshot.
    #[instrument(name = "trace_store.sample", skip(self))]
    pub fn get_traces_by_priority(&self, k: usize) -> Vec<Trace> {
        let state = self.state.read();
        let mut rng = self.rng.lock();

        let mut out: Vec<Trace> = Vec::with_capacity(k.min(state.traces.len()));
        let mut run: Vec<Uuid> = Vec::new();
        let mut run_bits: Option<u32> = None;

        let mut flush = |run: &mut Vec<Uuid>, out: &mut Vec<Trace>| {
            fisher_yates(run, &mut *rng);
            for id in run.drain(..) {
                if out.len() >= k {
                    break;
                }
                if let Some(trace) = state.traces.get(&id) {
                    out.push(trace.clone());
                }
            }
        };

        for ((bits, _), id) in state.index.iter().rev() {
            if run_bits != Some(*bits) {
                flush(&mut run, &mut out);
                if out.len() >= k {
                    return out;
                }
                run_bits = Some(*bits);
            }
            run.push(*id);
        }
        flush(&mut run, &mut out);
        out
    }

    /// Applies TD feedback: `priority = |td|^alpha`, clamped to the replay
    /// range, then reindexes. Unknown ids are ignored.
    #[instrument(name = "trace_store.update_priorities", skip_all, fields(count = ids.len()))]
    pub fn update_priorities(&self, ids: &[Uuid], td_errors: &[f32], alpha: f32) {
        debug_assert_eq!(ids.len(), td_errors.len());
        let mut state = self.state.write();

        for (id, td) in ids.iter().zip(td_errors.iter()) {
            let Some(old_key) = state.key_of.get(id).copied() else {
                continue;
            };
            let priority = td.abs().powf(alpha).clamp(PRIORITY_MIN, PRIORITY_MAX);

            state.index.remove(&old_key);
            let new_key = (priority_bits(priority), old_key.1);
            state.index.insert(new_key, *id);
            state.key_of.insert(*id, new_key);
            if let Some(trace) = state.traces.get_mut(id) {
                trace.priority = priority;
            }
        }
    }

    /// Drops traces older than the retention window and garbage-collects
    /// unmatched start spans past their grace period.
    #[instrument(name = "trace_store.retention_sweep", skip(self))]
    pub fn retention_sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let start_cutoff = now - self.start_timeout;
        let mut state = self.state.write();
        let state = &mut *state;

        let expired: Vec<Uuid> = state
            .traces
            .values()
            .filter(|trace| trace.timestamp < cutoff)
            .map(|trace| trace.trace_id)
            .collect();

        for id in &expired {
            if let Some(trace) = state.traces.remove(id) {
                if let Some(key) = state.key_of.remove(id) {
                    state.index.remove(&key);
                }
                if trace.kind.is_start() {
                    if let Some(open) = state.open_spans.get_mut(&(trace.kind, trace.target_id)) {
                        open.retain(|open_id| open_id != id);
                    }
                }
            }
        }

        // Unmatched starts are forgotten from the span table after the
        // timeout; the traces themselves stay until retention reaps them.
        let mut stale = 0usize;
        for open in state.open_spans.values_mut() {
            let before = open.len();
            open.retain(|id| {
                state
                    .traces
                    .get(id)
                    .map(|trace| trace.timestamp >= start_cutoff)
                    .unwrap_or(false)
            });
            stale += before - open.len();
        }
        state.open_spans.retain(|_, open| !open.is_empty());

        debug!(
            expired = expired.len(),
            stale_starts = stale,
            "retention sweep complete"
        );
        expired.len()
    }
}
