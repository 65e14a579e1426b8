//! Prioritized experience replay for the Cortex gateway.
//!
//! The [`TraceStore`] keeps the episodic execution log with a priority
//! index; the [`PerTrainer`] samples it, builds contrastive batches, and
//! drives the `cortex-train-kernel` subprocess without ever blocking the
//! serving path.

pub mod error;
pub mod kernel;
pub mod store;
pub mod trace;
pub mod trainer;

pub use error::{ReplayError, Result};
pub use kernel::{run_training, KernelConfig, KernelInput, KernelOutput};
pub use store::{TraceStore, PRIORITY_MAX, PRIORITY_MIN};
pub use trace::{Outcome, Trace, TraceKind, INITIAL_PRIORITY};
pub use trainer::{
    PerTrainer, TrainOutcome, TrainReport, BATCH_EPOCHS, BATCH_MAX_TRACES, LIVE_EPOCHS,
    LIVE_MAX_TRACES,
};
