pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod filter;
pub mod progress;
pub mod range;
pub mod verify;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use config::RunConfig;
pub use coordinator::{Coordinator, RunOutcome, RunReport};
pub use filter::{CandidateFilter, FilterChain};
pub use range::{partition, SearchRange, WorkerAssignment};
pub use verify::{Fingerprint, Verifier};

/// Cooperative stop flag shared by the coordinator, every worker and the
/// signal handler. Workers poll it once per candidate.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
