//! # Coordinator — Launch Workers, Aggregate Events, Decide the Outcome
//!
//! The coordinator is a single control loop. It never verifies a candidate;
//! it only reacts to events, so it cannot throttle the workers.
//!
//! ## Lifecycle
//!
//! 1. Validate the configuration and compute its fingerprint.
//! 2. Partition the range. Resume from a valid checkpoint or start fresh
//!    (writing an initial checkpoint). A checkpoint written by a different
//!    configuration is a fatal `CheckpointMismatch`.
//! 3. Spawn one worker thread per sub-range.
//! 4. Wait on the event lanes and two tickers (checkpoint, report). Per-worker
//!    positions only ever move forward and only to values a worker reported.
//! 5. End in exactly one outcome:
//!
//! | Outcome | Trigger | Checkpoint |
//! |---------|---------|------------|
//! | `Found` | first Found event; later ones are logged and ignored | cleared |
//! | `Exhausted` | every worker exhausted its range | cleared |
//! | `Failed` | a worker failed (policy `abort` cancels the rest) | saved |
//! | `Cancelled` | external cancellation | saved |
//!
//! After cancellation the coordinator waits up to `shutdown_grace` for every
//! worker's terminal event. Workers still running then are detached and their
//! last reported position is what gets checkpointed.

use chrono::{DateTime, Utc};
use crossbeam_channel::{after, never, select, tick, Receiver};
use rug::Integer;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::checkpoint::{abbreviate, CheckpointRecord, CheckpointStore, WorkerCheckpoint};
use crate::config::{FailurePolicy, RunConfig};
use crate::error::ConfigError;
use crate::events::{self, Counters, ProgressEvent, TerminalEvent, TerminalKind};
use crate::filter::CandidateFilter;
use crate::progress::{NullSink, ProgressSink, Snapshot};
use crate::range::{assign, partition, to_hex, SearchRange, WorkerAssignment};
use crate::verify::{Fingerprint, Verifier};
use crate::worker::{self, Worker, WorkerContext, WorkerState};
use crate::CancelToken;

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Found {
        worker_id: usize,
        candidate: Integer,
        fingerprint: Fingerprint,
    },
    Exhausted,
    Failed {
        worker_id: usize,
        error: String,
    },
    Cancelled,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Found { .. } => "found",
            RunOutcome::Exhausted => "exhausted",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Cumulative across resumed sessions.
    pub totals: Counters,
    /// Examined by this run only.
    pub session_examined: u64,
    pub elapsed: Duration,
    /// Final position per worker.
    pub positions: Vec<Integer>,
    pub resumed: bool,
    /// Found events that arrived after the first one.
    pub ignored_finds: usize,
}

/// How to treat an existing checkpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartMode {
    /// Resume from a matching checkpoint, start fresh without one, fail on
    /// a mismatching one.
    #[default]
    Resume,
    /// Discard any checkpoint and start from the range start.
    Fresh,
}

/// Coordinator's view of one worker, built only from received events.
struct Track {
    range: SearchRange,
    position: Integer,
    counters: Counters,
    terminal: Option<TerminalKind>,
}

impl Track {
    fn advance(&mut self, position: &Integer, counters: Counters) {
        if *position > self.position {
            self.position = position.clone();
        }
        if counters.examined >= self.counters.examined {
            self.counters = counters;
        }
    }

    fn remaining(&self) -> Integer {
        let left = Integer::from(&self.range.past_end() - &self.position);
        if left < 0 {
            Integer::new()
        } else {
            left
        }
    }
}

struct RunState {
    tracks: Vec<Track>,
    handles: Vec<Option<JoinHandle<WorkerState>>>,
    base_examined: u64,
    started_at: DateTime<Utc>,
    found: Option<RunOutcome>,
    failure: Option<RunOutcome>,
    ignored_finds: usize,
    stopping: bool,
}

impl RunState {
    fn all_done(&self) -> bool {
        self.tracks.iter().all(|t| t.terminal.is_some())
    }

    fn totals(&self) -> Counters {
        self.tracks
            .iter()
            .fold(Counters::default(), |acc, t| acc + t.counters)
    }

    fn session_examined(&self) -> u64 {
        self.totals().examined.saturating_sub(self.base_examined)
    }

    fn positions(&self) -> Vec<Integer> {
        self.tracks.iter().map(|t| t.position.clone()).collect()
    }
}

pub struct Coordinator {
    config: RunConfig,
    verifier: Arc<dyn Verifier>,
    filter: Arc<dyn CandidateFilter>,
    target: Arc<Fingerprint>,
    store: CheckpointStore,
    sink: Box<dyn ProgressSink>,
    cancel: CancelToken,
}

impl Coordinator {
    pub fn new(
        config: RunConfig,
        verifier: Arc<dyn Verifier>,
        filter: Arc<dyn CandidateFilter>,
        target: Fingerprint,
        store: CheckpointStore,
    ) -> Self {
        Coordinator {
            config,
            verifier,
            filter,
            target: Arc::new(target),
            store,
            sink: Box::new(NullSink),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use an externally owned token, e.g. one set by a signal handler.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn fingerprint(&self) -> String {
        self.config.fingerprint(
            self.verifier.name(),
            &self.filter.describe(),
            &self.target,
        )
    }

    /// Run to completion. Only configuration problems are errors; every
    /// other way a run can end is a `RunOutcome`.
    pub fn run(mut self, mode: StartMode) -> Result<RunReport, ConfigError> {
        self.config.validate()?;
        let fingerprint = self.fingerprint();
        let parts = partition(&self.config.range, self.config.workers)?;

        if mode == StartMode::Fresh {
            self.store.clear();
        }
        let (plan, resumed) = match self.store.load() {
            Some(record) => (self.resume_plan(record, &fingerprint, &parts)?, true),
            None => (fresh_plan(assign(&self.config.range, self.config.workers)?), false),
        };

        info!(
            range = %self.config.range,
            workers = self.config.workers,
            verifier = self.verifier.name(),
            filter = %self.filter.describe(),
            resumed,
            "scan starting"
        );

        let mut state = RunState {
            base_examined: plan
                .assignments
                .iter()
                .map(|(_, c)| c.examined)
                .sum(),
            tracks: plan
                .assignments
                .iter()
                .map(|(a, c)| Track {
                    range: a.range.clone(),
                    position: a.resume_from.clone(),
                    counters: *c,
                    terminal: None,
                })
                .collect(),
            handles: Vec::with_capacity(plan.assignments.len()),
            started_at: plan.started_at,
            found: None,
            failure: None,
            ignored_finds: 0,
            stopping: false,
        };

        if !resumed {
            self.save_checkpoint(&state, &fingerprint);
        }

        let start = Instant::now();
        let (tx, rx) = events::channel(self.config.channel_capacity);
        for (assignment, counters) in plan.assignments {
            let worker_id = assignment.worker_id;
            let ctx = WorkerContext {
                verifier: Arc::clone(&self.verifier),
                filter: Arc::clone(&self.filter),
                target: Arc::clone(&self.target),
                progress_interval: self.config.progress_interval,
                error_threshold: self.config.error_threshold,
                cancel: self.cancel.clone(),
                events: tx.clone(),
            };
            match worker::spawn(Worker::new(assignment, counters, ctx)) {
                Ok(handle) => state.handles.push(Some(handle)),
                Err(e) => {
                    state.handles.push(None);
                    let position = state.tracks[worker_id].position.clone();
                    let counters = state.tracks[worker_id].counters;
                    self.on_terminal(
                        &mut state,
                        TerminalEvent {
                            worker_id,
                            position,
                            counters,
                            kind: TerminalKind::Failed {
                                error: format!("could not spawn worker thread: {}", e),
                            },
                            timestamp: Instant::now(),
                        },
                    );
                }
            }
        }
        // Workers hold the only senders now; disconnection means they are all gone
        drop(tx);

        self.event_loop(&mut state, rx.terminal, rx.progress, &fingerprint, start);

        let outcome = if let Some(found) = state.found.take() {
            self.store.clear();
            found
        } else if let Some(failure) = state.failure.take() {
            self.save_checkpoint(&state, &fingerprint);
            failure
        } else if state
            .tracks
            .iter()
            .all(|t| t.terminal == Some(TerminalKind::Exhausted))
        {
            self.store.clear();
            RunOutcome::Exhausted
        } else {
            self.save_checkpoint(&state, &fingerprint);
            RunOutcome::Cancelled
        };

        let elapsed = start.elapsed();
        self.report(&state, elapsed);
        join_finished(&mut state);

        info!(
            outcome = outcome.label(),
            examined = state.totals().examined,
            session_examined = state.session_examined(),
            elapsed_secs = elapsed.as_secs_f64(),
            "scan finished"
        );

        Ok(RunReport {
            outcome,
            totals: state.totals(),
            session_examined: state.session_examined(),
            elapsed,
            positions: state.positions(),
            resumed,
            ignored_finds: state.ignored_finds,
        })
    }

    fn event_loop(
        &mut self,
        state: &mut RunState,
        mut terminal_rx: Receiver<TerminalEvent>,
        mut progress_rx: Receiver<ProgressEvent>,
        fingerprint: &str,
        start: Instant,
    ) {
        let checkpoint_tick = tick(self.config.checkpoint_interval);
        let report_tick = tick(self.config.report_interval);
        let mut grace: Receiver<Instant> = never();
        let mut grace_armed = false;

        while !state.all_done() {
            let mut terminal_closed = false;
            let mut progress_closed = false;
            select! {
                recv(terminal_rx) -> msg => match msg {
                    Ok(ev) => self.on_terminal(state, ev),
                    Err(_) => {
                        self.mark_lost(state, "worker exited without a terminal event");
                        terminal_closed = true;
                    }
                },
                recv(progress_rx) -> msg => match msg {
                    Ok(ev) => on_progress(state, ev),
                    Err(_) => progress_closed = true,
                },
                recv(checkpoint_tick) -> _ => {
                    if !state.stopping {
                        self.save_checkpoint(state, fingerprint);
                    }
                },
                recv(report_tick) -> _ => {
                    self.report(state, start.elapsed());
                    self.reap_dead_workers(state, &terminal_rx);
                },
                recv(grace) -> _ => {
                    let pending: Vec<usize> = state
                        .tracks
                        .iter()
                        .enumerate()
                        .filter(|(_, t)| t.terminal.is_none())
                        .map(|(id, _)| id)
                        .collect();
                    warn!(
                        workers = ?pending,
                        grace_secs = self.config.shutdown_grace.as_secs_f64(),
                        "workers did not stop in time, detaching"
                    );
                    break;
                },
            }

            // Disconnected lanes would otherwise be ready forever
            if terminal_closed {
                terminal_rx = never();
            }
            if progress_closed {
                progress_rx = never();
            }
            if !state.stopping && self.cancel.is_cancelled() {
                state.stopping = true;
                info!("cancellation requested, waiting for workers");
            }
            if state.stopping && !grace_armed {
                grace = after(self.config.shutdown_grace);
                grace_armed = true;
            }
        }

        // Late progress events can only move positions forward
        for ev in progress_rx.try_iter() {
            on_progress(state, ev);
        }
    }

    fn on_terminal(&self, state: &mut RunState, ev: TerminalEvent) {
        let Some(track) = state.tracks.get_mut(ev.worker_id) else {
            error!(worker_id = ev.worker_id, "terminal event from unknown worker");
            return;
        };
        if track.terminal.is_some() {
            return;
        }
        track.advance(&ev.position, ev.counters);
        track.terminal = Some(ev.kind.clone());

        match ev.kind {
            TerminalKind::Found {
                candidate,
                fingerprint,
            } => {
                if state.found.is_some() {
                    state.ignored_finds += 1;
                    warn!(
                        worker_id = ev.worker_id,
                        candidate = %to_hex(&candidate),
                        "additional match ignored"
                    );
                    return;
                }
                info!(
                    worker_id = ev.worker_id,
                    candidate = %to_hex(&candidate),
                    fingerprint = %fingerprint,
                    "match found, stopping workers"
                );
                state.found = Some(RunOutcome::Found {
                    worker_id: ev.worker_id,
                    candidate,
                    fingerprint,
                });
                self.stop_all(state);
            }
            TerminalKind::Failed { error } => {
                error!(worker_id = ev.worker_id, error = %error, "worker failed");
                if state.failure.is_none() {
                    state.failure = Some(RunOutcome::Failed {
                        worker_id: ev.worker_id,
                        error,
                    });
                }
                match self.config.failure_policy {
                    FailurePolicy::Abort => self.stop_all(state),
                    FailurePolicy::Continue => {
                        warn!(worker_id = ev.worker_id, "continuing with remaining workers")
                    }
                }
            }
            TerminalKind::Exhausted | TerminalKind::Cancelled => {}
        }
    }

    fn stop_all(&self, state: &mut RunState) {
        self.cancel.cancel();
        state.stopping = true;
    }

    /// Any worker whose thread ended without us holding its terminal event.
    fn reap_dead_workers(&self, state: &mut RunState, terminal_rx: &Receiver<TerminalEvent>) {
        let dead: Vec<usize> = state
            .handles
            .iter()
            .enumerate()
            .filter(|(id, h)| {
                state.tracks[*id].terminal.is_none()
                    && h.as_ref().is_some_and(|h| h.is_finished())
            })
            .map(|(id, _)| id)
            .collect();
        if dead.is_empty() {
            return;
        }
        // Their terminal events may still be queued
        for ev in terminal_rx.try_iter() {
            self.on_terminal(state, ev);
        }
        for id in dead {
            if state.tracks[id].terminal.is_none() {
                self.fail_lost(state, id, "worker thread died without a terminal event");
            }
        }
    }

    fn mark_lost(&self, state: &mut RunState, reason: &str) {
        let lost: Vec<usize> = state
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.terminal.is_none())
            .map(|(id, _)| id)
            .collect();
        for id in lost {
            self.fail_lost(state, id, reason);
        }
    }

    fn fail_lost(&self, state: &mut RunState, worker_id: usize, reason: &str) {
        let position = state.tracks[worker_id].position.clone();
        let counters = state.tracks[worker_id].counters;
        self.on_terminal(
            state,
            TerminalEvent {
                worker_id,
                position,
                counters,
                kind: TerminalKind::Failed {
                    error: reason.to_string(),
                },
                timestamp: Instant::now(),
            },
        );
    }

    fn resume_plan(
        &self,
        record: CheckpointRecord,
        fingerprint: &str,
        parts: &[SearchRange],
    ) -> Result<Plan, ConfigError> {
        if record.config_fingerprint != fingerprint {
            return Err(ConfigError::CheckpointMismatch(format!(
                "{} was written for configuration {}, current is {}",
                self.store.path().display(),
                abbreviate(&record.config_fingerprint),
                abbreviate(fingerprint)
            )));
        }
        if record.range != self.config.range || record.workers.len() != parts.len() {
            return Err(ConfigError::CheckpointMismatch(format!(
                "{} covers {} with {} workers, current run is {} with {}",
                self.store.path().display(),
                record.range,
                record.workers.len(),
                self.config.range,
                parts.len()
            )));
        }

        let mut assignments = Vec::with_capacity(parts.len());
        for (id, (w, part)) in record.workers.into_iter().zip(parts).enumerate() {
            let in_bounds = w.resume_from >= part.start && w.resume_from <= part.past_end();
            if w.worker_id != id || w.range != *part || !in_bounds {
                return Err(ConfigError::CheckpointMismatch(format!(
                    "worker {} entry ({} at {}) does not fit partition {}",
                    id,
                    w.range,
                    to_hex(&w.resume_from),
                    part
                )));
            }
            assignments.push((
                WorkerAssignment {
                    worker_id: id,
                    range: w.range,
                    resume_from: w.resume_from,
                },
                w.counters,
            ));
        }

        info!(
            path = %self.store.path().display(),
            saved_at = %record.saved_at,
            "resuming from checkpoint"
        );
        Ok(Plan {
            assignments,
            started_at: record.started_at,
        })
    }

    fn save_checkpoint(&self, state: &RunState, fingerprint: &str) {
        let record = CheckpointRecord {
            config_fingerprint: fingerprint.to_string(),
            range: self.config.range.clone(),
            workers: state
                .tracks
                .iter()
                .enumerate()
                .map(|(id, t)| WorkerCheckpoint {
                    worker_id: id,
                    range: t.range.clone(),
                    resume_from: t.position.clone(),
                    counters: t.counters,
                })
                .collect(),
            started_at: state.started_at,
            saved_at: Utc::now(),
        };
        // A failed write is retried at the next interval
        if let Err(e) = self.store.save(&record) {
            warn!(path = %self.store.path().display(), error = %e, "checkpoint save failed");
        }
    }

    fn report(&mut self, state: &RunState, elapsed: Duration) {
        let remaining: Integer = state.tracks.iter().map(|t| t.remaining()).sum();
        let snapshot = Snapshot::compute(
            state.totals(),
            state.session_examined(),
            elapsed,
            &self.config.range.len(),
            &remaining,
            state.positions(),
        );
        self.sink.report(&snapshot);
    }
}

struct Plan {
    assignments: Vec<(WorkerAssignment, Counters)>,
    started_at: DateTime<Utc>,
}

fn fresh_plan(assignments: Vec<WorkerAssignment>) -> Plan {
    Plan {
        assignments: assignments
            .into_iter()
            .map(|a| (a, Counters::default()))
            .collect(),
        started_at: Utc::now(),
    }
}

fn on_progress(state: &mut RunState, ev: ProgressEvent) {
    if let Some(track) = state.tracks.get_mut(ev.worker_id) {
        track.advance(&ev.position, ev.counters);
    }
}

fn join_finished(state: &mut RunState) {
    for (id, slot) in state.handles.iter_mut().enumerate() {
        let Some(handle) = slot.take() else { continue };
        if state.tracks[id].terminal.is_none() && !handle.is_finished() {
            // Detached; it stops on its own once it polls the cancel flag
            continue;
        }
        if handle.join().is_err() {
            error!(worker_id = id, "worker thread panicked");
        }
    }
}
