//! # Worker — Scan One Sub-Range
//!
//! A worker owns one `WorkerAssignment` and walks it one candidate at a time:
//!
//! ```text
//! Idle ──► Scanning ──► Found | Exhausted | Cancelled | Failed
//!            ▲    │
//!            └────┘ next candidate
//! ```
//!
//! Per candidate: check for exhaustion, then for cancellation, then run the
//! filter; only accepted candidates reach the verifier. A progress event is
//! emitted every `progress_interval` candidates (count-based, so slow
//! verifiers still report), and exactly one terminal event ends the scan.
//!
//! ## Errors
//!
//! A verifier failure (including a panic) is counted and the candidate is
//! skipped. Only a streak of more than `error_threshold` consecutive failures,
//! with no successful verification in between, promotes the worker to Failed.

use rug::Integer;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

use crate::error::VerifyError;
use crate::events::{Counters, EventSender, ProgressEvent, TerminalEvent, TerminalKind};
use crate::filter::CandidateFilter;
use crate::range::{to_hex, WorkerAssignment};
use crate::verify::{Fingerprint, Verifier};
use crate::CancelToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Scanning,
    Found,
    Exhausted,
    Cancelled,
    Failed,
}

/// Everything a worker shares with its siblings.
#[derive(Clone)]
pub struct WorkerContext {
    pub verifier: Arc<dyn Verifier>,
    pub filter: Arc<dyn CandidateFilter>,
    pub target: Arc<Fingerprint>,
    pub progress_interval: u64,
    pub error_threshold: u32,
    pub cancel: CancelToken,
    pub events: EventSender,
}

/// Result of examining one candidate.
enum Examined {
    Filtered,
    Miss,
    Hit(Fingerprint),
    Error(VerifyError),
}

pub struct Worker {
    assignment: WorkerAssignment,
    state: WorkerState,
    position: Integer,
    counters: Counters,
    consecutive_errors: u32,
    ctx: WorkerContext,
}

impl Worker {
    /// `counters` are the totals carried over from a checkpoint (zero when fresh).
    pub fn new(assignment: WorkerAssignment, counters: Counters, ctx: WorkerContext) -> Self {
        let position = assignment.resume_from.clone();
        Worker {
            assignment,
            state: WorkerState::Idle,
            position,
            counters,
            consecutive_errors: 0,
            ctx,
        }
    }

    pub fn id(&self) -> usize {
        self.assignment.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Scan until a terminal state and return it. Emits all events.
    pub fn run(mut self) -> WorkerState {
        let span = info_span!("worker", worker_id = self.id());
        let _guard = span.enter();

        self.state = WorkerState::Scanning;
        if self.position == self.assignment.range.start {
            debug!(range = %self.assignment.range, "scan starting");
        } else {
            info!(
                range = %self.assignment.range,
                resume_from = %to_hex(&self.position),
                "scan resuming"
            );
        }

        let interval = self.ctx.progress_interval.max(1);
        let mut since_report: u64 = 0;

        let kind = loop {
            if self.position > self.assignment.range.end {
                break TerminalKind::Exhausted;
            }
            if self.ctx.cancel.is_cancelled() {
                break TerminalKind::Cancelled;
            }

            let examined = self.examine();
            self.counters.examined += 1;
            match examined {
                Examined::Filtered => self.counters.filtered += 1,
                Examined::Miss => self.consecutive_errors = 0,
                Examined::Hit(fingerprint) => {
                    let candidate = self.position.clone();
                    self.position += 1u32;
                    break TerminalKind::Found {
                        candidate,
                        fingerprint,
                    };
                }
                Examined::Error(e) => {
                    self.counters.errors += 1;
                    self.consecutive_errors += 1;
                    debug!(candidate = %to_hex(&self.position), error = %e, "candidate skipped");
                    if self.consecutive_errors > self.ctx.error_threshold {
                        self.position += 1u32;
                        break TerminalKind::Failed {
                            error: format!(
                                "{} consecutive verifier errors, last: {}",
                                self.consecutive_errors, e
                            ),
                        };
                    }
                }
            }
            self.position += 1u32;

            since_report += 1;
            if since_report >= interval {
                since_report = 0;
                self.ctx.events.progress(ProgressEvent {
                    worker_id: self.id(),
                    position: self.position.clone(),
                    counters: self.counters,
                    timestamp: Instant::now(),
                });
            }
        };

        self.finish(kind)
    }

    fn examine(&self) -> Examined {
        if !self.ctx.filter.accept(&self.position) {
            return Examined::Filtered;
        }
        let verifier = &self.ctx.verifier;
        let candidate = &self.position;
        match panic::catch_unwind(AssertUnwindSafe(|| verifier.verify(candidate))) {
            Ok(Ok(fp)) if fp == *self.ctx.target => Examined::Hit(fp),
            Ok(Ok(_)) => Examined::Miss,
            Ok(Err(e)) => Examined::Error(e),
            Err(payload) => Examined::Error(VerifyError::Panicked(panic_message(&*payload))),
        }
    }

    fn finish(mut self, kind: TerminalKind) -> WorkerState {
        self.state = match &kind {
            TerminalKind::Found { .. } => WorkerState::Found,
            TerminalKind::Exhausted => WorkerState::Exhausted,
            TerminalKind::Cancelled => WorkerState::Cancelled,
            TerminalKind::Failed { .. } => WorkerState::Failed,
        };

        match &kind {
            TerminalKind::Found { candidate, .. } => {
                info!(candidate = %to_hex(candidate), "target found")
            }
            TerminalKind::Failed { error } => warn!(error = %error, "worker failed"),
            _ => debug!(
                state = kind.label(),
                position = %to_hex(&self.position),
                examined = self.counters.examined,
                "scan stopped"
            ),
        }

        let delivered = self.ctx.events.terminal(TerminalEvent {
            worker_id: self.id(),
            position: self.position.clone(),
            counters: self.counters,
            kind,
            timestamp: Instant::now(),
        });
        if !delivered {
            warn!("coordinator gone, terminal event lost");
        }
        self.state
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

/// Run `worker` on its own named OS thread.
pub fn spawn(worker: Worker) -> io::Result<thread::JoinHandle<WorkerState>> {
    thread::Builder::new()
        .name(format!("keysweep-worker-{}", worker.id()))
        .spawn(move || worker.run())
}
