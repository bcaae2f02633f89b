//! # Events — Worker → Coordinator Messages
//!
//! Workers never touch shared state; everything the coordinator knows about a
//! worker arrives as an event. Two lanes carry them:
//!
//! | Lane | Channel | When full |
//! |------|---------|-----------|
//! | progress | bounded | oldest queued event is dropped |
//! | terminal | unbounded | never full, never dropped |
//!
//! Counters in every event are cumulative for the worker, so losing a
//! progress event only delays the coordinator's view until the next one.
//! Within one worker, positions are strictly increasing.
//!
//! A position is the next candidate the worker has not examined yet: every
//! candidate below it (within the worker's range) is done.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use rug::Integer;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::verify::Fingerprint;

/// Cumulative per-worker counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Candidates the cursor has passed: filtered, verified or errored.
    pub examined: u64,
    /// Candidates rejected by the filter (never verified).
    pub filtered: u64,
    /// Candidates the verifier failed on.
    pub errors: u64,
}

impl Counters {
    pub fn verified(&self) -> u64 {
        self.examined - self.filtered - self.errors
    }
}

impl std::ops::Add for Counters {
    type Output = Counters;

    fn add(self, rhs: Counters) -> Counters {
        Counters {
            examined: self.examined + rhs.examined,
            filtered: self.filtered + rhs.filtered,
            errors: self.errors + rhs.errors,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub worker_id: usize,
    pub position: Integer,
    pub counters: Counters,
    pub timestamp: Instant,
}

/// How a worker's scan ended.
#[derive(Clone, Debug, PartialEq)]
pub enum TerminalKind {
    Found {
        candidate: Integer,
        fingerprint: Fingerprint,
    },
    Exhausted,
    Cancelled,
    Failed {
        error: String,
    },
}

impl TerminalKind {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalKind::Found { .. } => "found",
            TerminalKind::Exhausted => "exhausted",
            TerminalKind::Cancelled => "cancelled",
            TerminalKind::Failed { .. } => "failed",
        }
    }
}

/// Last message from a worker; carries its final position and counters.
#[derive(Clone, Debug)]
pub struct TerminalEvent {
    pub worker_id: usize,
    pub position: Integer,
    pub counters: Counters,
    pub kind: TerminalKind,
    pub timestamp: Instant,
}

/// Worker half of the event lanes. Cheap to clone, one per worker.
#[derive(Clone)]
pub struct EventSender {
    progress: Sender<ProgressEvent>,
    // Lets a sender evict the oldest queued event when the lane is full
    progress_evict: Receiver<ProgressEvent>,
    terminal: Sender<TerminalEvent>,
}

/// Coordinator half of the event lanes.
pub struct EventReceiver {
    pub progress: Receiver<ProgressEvent>,
    pub terminal: Receiver<TerminalEvent>,
}

pub fn channel(progress_capacity: usize) -> (EventSender, EventReceiver) {
    let (ptx, prx) = bounded(progress_capacity.max(1));
    let (ttx, trx) = unbounded();
    (
        EventSender {
            progress: ptx,
            progress_evict: prx.clone(),
            terminal: ttx,
        },
        EventReceiver {
            progress: prx,
            terminal: trx,
        },
    )
}

impl EventSender {
    /// Queue a progress event without blocking. Returns false if an event was
    /// lost (an older one evicted, or this one dropped) or nobody is listening.
    pub fn progress(&self, event: ProgressEvent) -> bool {
        match self.progress.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => false,
            Err(TrySendError::Full(event)) => {
                let _ = self.progress_evict.try_recv();
                let _ = self.progress.try_send(event);
                false
            }
        }
    }

    /// Deliver a terminal event. Only fails if the coordinator is gone.
    pub fn terminal(&self, event: TerminalEvent) -> bool {
        self.terminal.send(event).is_ok()
    }
}
