//! # Progress — Aggregate Snapshots and Reporting Sinks
//!
//! The coordinator turns the events it has received into a `Snapshot` every
//! `report_interval` and once more at the end of the run, and pushes it to a
//! `ProgressSink`. Sinks only render; they never feed back into the engine.
//!
//! `TracingSink` logs one structured line per snapshot: examined count,
//! rate (candidates/sec over this session), percent of the range covered,
//! ETA and elapsed time.

use rug::Integer;
use std::time::Duration;
use tracing::info;

use crate::events::Counters;
use crate::range::to_hex;

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Cumulative across resumed sessions.
    pub totals: Counters,
    /// Examined by this process only.
    pub session_examined: u64,
    pub elapsed: Duration,
    /// Candidates per second over this session.
    pub rate: f64,
    /// Share of the whole range covered, 0–100.
    pub percent: f64,
    pub eta: Option<Duration>,
    /// Last reported position per worker.
    pub positions: Vec<Integer>,
}

impl Snapshot {
    /// Derive rate, percent and ETA from raw figures.
    pub fn compute(
        totals: Counters,
        session_examined: u64,
        elapsed: Duration,
        range_len: &Integer,
        remaining: &Integer,
        positions: Vec<Integer>,
    ) -> Self {
        let rate = if elapsed.as_secs_f64() > 0.0 {
            session_examined as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let len = range_len.to_f64();
        let left = remaining.to_f64();
        let percent = if len > 0.0 {
            ((len - left) / len * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };
        let eta = if rate > 0.0 {
            Duration::try_from_secs_f64(left / rate).ok()
        } else {
            None
        };
        Snapshot {
            totals,
            session_examined,
            elapsed,
            rate,
            percent,
            eta,
            positions,
        }
    }
}

/// Consumer of periodic snapshots.
pub trait ProgressSink: Send {
    fn report(&mut self, snapshot: &Snapshot);
}

/// Logs every snapshot through `tracing`.
#[derive(Default)]
pub struct TracingSink {
    /// Also log each worker's position.
    pub per_worker: bool,
}

impl ProgressSink for TracingSink {
    fn report(&mut self, s: &Snapshot) {
        info!(
            examined = s.totals.examined,
            filtered = s.totals.filtered,
            errors = s.totals.errors,
            rate = format_args!("{:.2}", s.rate),
            percent = format_args!("{:.8}", s.percent),
            eta = %s.eta.map(format_hms).unwrap_or_else(|| "-".into()),
            elapsed = %format_hms(s.elapsed),
            "scan progress"
        );
        if self.per_worker {
            for (worker_id, pos) in s.positions.iter().enumerate() {
                info!(worker_id, position = %to_hex(pos), "worker position");
            }
        }
    }
}

/// Discards snapshots.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&mut self, _snapshot: &Snapshot) {}
}

/// `HH:MM:SS`; hours keep growing past 99.
pub fn format_hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
