//! End-to-end engine tests: coordinator, workers, events and checkpoints
//! together, on small ranges with cheap verifiers.
//!
//! No network access required. Every test uses its own temp directory for the
//! checkpoint file.
//!
//! # Covered behavior
//!
//! - A unique match is found with any worker count, never reported Exhausted.
//! - A missing target is Exhausted after exactly `end - start + 1` candidates.
//! - Cancel then resume examines each candidate exactly once across both runs.
//! - Several simultaneous matches produce a single Found.
//! - Failure policies `abort` and `continue`.
//! - Checkpoint mismatch, corrupt checkpoints and `StartMode::Fresh`.
//! - Periodic snapshots and checkpoints while a scan is running.
//! - Workers stuck past the shutdown grace are detached.

use keysweep::checkpoint::CheckpointStore;
use keysweep::config::{FailurePolicy, RunConfig};
use keysweep::coordinator::{Coordinator, RunOutcome, RunReport, StartMode};
use keysweep::error::{ConfigError, VerifyError};
use keysweep::filter::{first_false_negative, AcceptAll, CandidateFilter, FilterConfig};
use keysweep::progress::{ProgressSink, Snapshot};
use keysweep::range::SearchRange;
use keysweep::verify::{Fingerprint, Sha256Verifier, Verifier};
use keysweep::CancelToken;
use rug::Integer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// == Helpers ===================================================================

fn range(start: u32, end: u32) -> SearchRange {
    SearchRange::new(Integer::from(start), Integer::from(end)).unwrap()
}

fn config(start: u32, end: u32, workers: usize) -> RunConfig {
    let mut c = RunConfig::new(range(start, end), workers);
    c.progress_interval = 16;
    c.checkpoint_interval = Duration::from_millis(50);
    c.report_interval = Duration::from_millis(50);
    c.shutdown_grace = Duration::from_secs(10);
    c
}

fn sha(n: u32) -> Fingerprint {
    Sha256Verifier.verify(&Integer::from(n)).unwrap()
}

fn checkpoint_path(dir: &TempDir) -> PathBuf {
    dir.path().join("engine.checkpoint")
}

fn run_with(
    cfg: RunConfig,
    verifier: Arc<dyn Verifier>,
    target: Fingerprint,
    dir: &TempDir,
    cancel: CancelToken,
    mode: StartMode,
) -> Result<RunReport, ConfigError> {
    Coordinator::new(
        cfg,
        verifier,
        Arc::new(AcceptAll),
        target,
        CheckpointStore::new(checkpoint_path(dir)),
    )
    .with_cancel_token(cancel)
    .run(mode)
}

fn run_sha(cfg: RunConfig, target: Fingerprint, dir: &TempDir) -> RunReport {
    run_with(
        cfg,
        Arc::new(Sha256Verifier),
        target,
        dir,
        CancelToken::new(),
        StartMode::Resume,
    )
    .unwrap()
}

/// SHA-256 that records every candidate it sees and can trip a cancel token
/// after a number of calls.
struct Recording {
    seen: Arc<Mutex<Vec<Integer>>>,
    calls: AtomicUsize,
    cancel_after: Option<(usize, CancelToken)>,
}

impl Recording {
    fn new(seen: Arc<Mutex<Vec<Integer>>>, cancel_after: Option<(usize, CancelToken)>) -> Self {
        Recording {
            seen,
            calls: AtomicUsize::new(0),
            cancel_after,
        }
    }
}

impl Verifier for Recording {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn fingerprint_len(&self) -> usize {
        32
    }

    fn verify(&self, candidate: &Integer) -> Result<Fingerprint, VerifyError> {
        self.seen.lock().unwrap().push(candidate.clone());
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if calls >= *limit {
                token.cancel();
            }
        }
        Sha256Verifier.verify(candidate)
    }
}

/// Every candidate maps to the fingerprint of `candidate % 1000`.
struct Modular;

impl Verifier for Modular {
    fn name(&self) -> &'static str {
        "modular"
    }

    fn fingerprint_len(&self) -> usize {
        32
    }

    fn verify(&self, candidate: &Integer) -> Result<Fingerprint, VerifyError> {
        let reduced = Integer::from(candidate % 1000u32);
        Sha256Verifier.verify(&reduced)
    }
}

/// Fails on every candidate in `[lo, hi]`.
struct Broken {
    lo: u32,
    hi: u32,
}

impl Verifier for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn fingerprint_len(&self) -> usize {
        32
    }

    fn verify(&self, candidate: &Integer) -> Result<Fingerprint, VerifyError> {
        if *candidate >= self.lo && *candidate <= self.hi {
            return Err(VerifyError::Derivation("backend unavailable".into()));
        }
        Sha256Verifier.verify(candidate)
    }
}

// == Found / Exhausted =========================================================

#[test]
fn unique_match_found_with_any_worker_count() {
    for workers in 1..=9 {
        let dir = tempfile::tempdir().unwrap();
        let report = run_sha(config(0x1000, 0x1fff, workers), sha(0x1abc), &dir);
        match report.outcome {
            RunOutcome::Found { candidate, .. } => assert_eq!(candidate, 0x1abc, "workers={}", workers),
            other => panic!("workers={}: expected Found, got {:?}", workers, other),
        }
        assert!(!checkpoint_path(&dir).exists());
    }
}

#[test]
fn match_at_range_bounds_is_found() {
    for target in [0x200u32, 0x2ff] {
        let dir = tempfile::tempdir().unwrap();
        let report = run_sha(config(0x200, 0x2ff, 4), sha(target), &dir);
        assert!(
            matches!(&report.outcome, RunOutcome::Found { candidate, .. } if *candidate == target),
            "{:?}",
            report.outcome
        );
    }
}

#[test]
fn missing_target_exhausts_after_every_candidate() {
    for workers in [1usize, 2, 3, 7, 16] {
        let dir = tempfile::tempdir().unwrap();
        let report = run_sha(config(5000, 7499, workers), sha(1), &dir);
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(report.totals.examined, 2500, "workers={}", workers);
        assert_eq!(report.totals.filtered, 0);
        assert_eq!(report.totals.errors, 0);
        assert_eq!(report.positions.len(), workers);
        assert_eq!(report.positions.last().unwrap(), &Integer::from(7500));
        assert!(!checkpoint_path(&dir).exists());
    }
}

#[test]
fn single_candidate_range() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_sha(config(42, 42, 1), sha(42), &dir);
    assert!(matches!(report.outcome, RunOutcome::Found { .. }));

    let dir = tempfile::tempdir().unwrap();
    let report = run_sha(config(42, 42, 1), sha(43), &dir);
    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.totals.examined, 1);
}

// == Resume ====================================================================

#[test]
fn cancel_and_resume_examines_each_candidate_once() {
    let dir = tempfile::tempdir().unwrap();
    let (start, end) = (10_000u32, 13_999u32);

    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancelToken::new();
    let first = run_with(
        config(start, end, 4),
        Arc::new(Recording::new(
            Arc::clone(&first_seen),
            Some((1500, cancel.clone())),
        )),
        sha(1),
        &dir,
        cancel,
        StartMode::Resume,
    )
    .unwrap();
    assert_eq!(first.outcome, RunOutcome::Cancelled);
    assert!(checkpoint_path(&dir).exists());
    let first_count = first_seen.lock().unwrap().len() as u64;
    assert_eq!(first.totals.examined, first_count);

    let second_seen = Arc::new(Mutex::new(Vec::new()));
    let second = run_with(
        config(start, end, 4),
        Arc::new(Recording::new(Arc::clone(&second_seen), None)),
        sha(1),
        &dir,
        CancelToken::new(),
        StartMode::Resume,
    )
    .unwrap();
    assert!(second.resumed);
    assert_eq!(second.outcome, RunOutcome::Exhausted);
    assert_eq!(second.totals.examined, (end - start + 1) as u64);
    assert_eq!(second.session_examined, (end - start + 1) as u64 - first_count);

    let mut counts: HashMap<Integer, usize> = HashMap::new();
    for n in first_seen
        .lock()
        .unwrap()
        .iter()
        .chain(second_seen.lock().unwrap().iter())
    {
        *counts.entry(n.clone()).or_default() += 1;
    }
    assert_eq!(counts.len(), (end - start + 1) as usize);
    for n in start..=end {
        assert_eq!(counts.get(&Integer::from(n)), Some(&1), "candidate {}", n);
    }
}

#[test]
fn resume_survives_operational_changes() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let first = run_with(
        config(0, 999, 2),
        Arc::new(Sha256Verifier),
        sha(5000),
        &dir,
        cancel,
        StartMode::Resume,
    )
    .unwrap();
    assert_eq!(first.outcome, RunOutcome::Cancelled);

    let mut cfg = config(0, 999, 2);
    cfg.channel_capacity = 3;
    cfg.progress_interval = 1;
    cfg.failure_policy = FailurePolicy::Continue;
    let second = run_sha(cfg, sha(5000), &dir);
    assert!(second.resumed);
    assert_eq!(second.outcome, RunOutcome::Exhausted);
}

#[test]
fn mismatched_checkpoint_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    run_with(
        config(0, 999, 2),
        Arc::new(Sha256Verifier),
        sha(5000),
        &dir,
        cancel,
        StartMode::Resume,
    )
    .unwrap();

    for (cfg, target) in [
        (config(0, 999, 3), sha(5000)),
        (config(0, 998, 2), sha(5000)),
        (config(0, 999, 2), sha(6000)),
    ] {
        let err = run_with(
            cfg,
            Arc::new(Sha256Verifier),
            target,
            &dir,
            CancelToken::new(),
            StartMode::Resume,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::CheckpointMismatch(_)), "{}", err);
        assert!(err.to_string().contains("--fresh"));
    }
    // Rejection leaves the file alone
    assert!(checkpoint_path(&dir).exists());

    let report = run_with(
        config(0, 999, 3),
        Arc::new(Sha256Verifier),
        sha(5000),
        &dir,
        CancelToken::new(),
        StartMode::Fresh,
    )
    .unwrap();
    assert!(!report.resumed);
    assert_eq!(report.totals.examined, 1000);
}

#[test]
fn corrupt_checkpoint_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(checkpoint_path(&dir), "{\"version\": 1, \"checks").unwrap();
    let report = run_sha(config(0, 499, 2), sha(5000), &dir);
    assert!(!report.resumed);
    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.totals.examined, 500);
}

#[test]
fn cancelled_position_is_next_unexamined() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancelToken::new();
    let first = run_with(
        config(0, 999, 1),
        Arc::new(Recording::new(Arc::clone(&seen), Some((600, cancel.clone())))),
        sha(5000),
        &dir,
        cancel,
        StartMode::Resume,
    )
    .unwrap();
    assert_eq!(first.outcome, RunOutcome::Cancelled);
    assert_eq!(first.positions, vec![Integer::from(600)]);

    let record = CheckpointStore::new(checkpoint_path(&dir)).load().unwrap();
    assert_eq!(record.workers[0].resume_from, 600);
    assert_eq!(record.totals().examined, 600);
}

// == Concurrent matches ========================================================

#[test]
fn simultaneous_matches_report_one_found() {
    for _ in 0..5 {
        let dir = tempfile::tempdir().unwrap();
        // Each of the three workers holds one candidate ≡ 777 (mod 1000)
        let report = run_with(
            config(0, 2999, 3),
            Arc::new(Modular),
            sha(777),
            &dir,
            CancelToken::new(),
            StartMode::Resume,
        )
        .unwrap();
        match &report.outcome {
            RunOutcome::Found { candidate, .. } => {
                assert!([777u32, 1777, 2777].iter().any(|c| candidate == c));
            }
            other => panic!("expected Found, got {:?}", other),
        }
        assert!(report.ignored_finds <= 2);
        assert!(!checkpoint_path(&dir).exists());
    }
}

// == Failures ==================================================================

#[test]
fn abort_policy_stops_run_and_keeps_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(0, 299_999, 3);
    cfg.error_threshold = 5;
    let report = run_with(
        cfg,
        Arc::new(Broken {
            lo: 100_000,
            hi: 199_999,
        }),
        sha(1_000_000),
        &dir,
        CancelToken::new(),
        StartMode::Resume,
    )
    .unwrap();

    match &report.outcome {
        RunOutcome::Failed { worker_id, error } => {
            assert_eq!(*worker_id, 1);
            assert!(error.contains("backend unavailable"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(report.positions[1], 100_006);
    assert!(report.totals.examined < 300_000);

    let record = CheckpointStore::new(checkpoint_path(&dir)).load().unwrap();
    assert_eq!(record.workers[1].resume_from, 100_006);
    assert_eq!(record.workers[1].counters.errors, 6);
}

#[test]
fn continue_policy_finishes_other_workers() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(0, 2999, 3);
    cfg.error_threshold = 5;
    cfg.failure_policy = FailurePolicy::Continue;
    let report = run_with(
        cfg,
        Arc::new(Broken { lo: 1000, hi: 1999 }),
        sha(1_000_000),
        &dir,
        CancelToken::new(),
        StartMode::Resume,
    )
    .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Failed { worker_id: 1, .. }));
    assert_eq!(report.positions[0], 1000);
    assert_eq!(report.positions[2], 3000);
    assert_eq!(report.totals.examined, 1000 + 6 + 1000);
    assert!(checkpoint_path(&dir).exists());
}

#[test]
fn continue_policy_still_reports_match() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(0, 2999, 3);
    cfg.error_threshold = 5;
    cfg.failure_policy = FailurePolicy::Continue;
    let report = run_with(
        cfg,
        Arc::new(Broken { lo: 1000, hi: 1999 }),
        sha(2500),
        &dir,
        CancelToken::new(),
        StartMode::Resume,
    )
    .unwrap();

    assert!(
        matches!(&report.outcome, RunOutcome::Found { candidate, .. } if *candidate == 2500),
        "{:?}",
        report.outcome
    );
    assert!(!checkpoint_path(&dir).exists());
}

#[test]
fn isolated_errors_and_panics_do_not_stop_a_worker() {
    struct Flaky;
    impl Verifier for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn fingerprint_len(&self) -> usize {
            32
        }
        fn verify(&self, c: &Integer) -> Result<Fingerprint, VerifyError> {
            if *c == 13 {
                panic!("unlucky candidate");
            }
            if Integer::from(c % 10u32) == 0 {
                return Err(VerifyError::MalformedCandidate {
                    candidate: c.to_string(),
                    reason: "round number".into(),
                });
            }
            Sha256Verifier.verify(c)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let report = run_with(
        config(1, 100, 2),
        Arc::new(Flaky),
        sha(5000),
        &dir,
        CancelToken::new(),
        StartMode::Resume,
    )
    .unwrap();
    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.totals.examined, 100);
    assert_eq!(report.totals.errors, 11);
}

// == Filters ===================================================================

#[test]
fn filtered_candidates_are_counted_not_verified() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let filters = FilterConfig {
        max_repeat: Some(2),
        window: Some(4),
        ..Default::default()
    };
    let chain = filters.build();
    let rejected = (0u32..=0xfff)
        .filter(|n| !chain.accept(&Integer::from(*n)))
        .count() as u64;
    assert!(rejected > 0);

    let dir = tempfile::tempdir().unwrap();
    let report = Coordinator::new(
        config(0, 0xfff, 4),
        Arc::new(Recording::new(Arc::clone(&seen), None)),
        Arc::new(chain),
        sha(1_000_000),
        CheckpointStore::new(checkpoint_path(&dir)),
    )
    .run(StartMode::Resume)
    .unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.totals.examined, 0x1000);
    assert_eq!(report.totals.filtered, rejected);
    assert_eq!(seen.lock().unwrap().len() as u64, 0x1000 - rejected);
}

#[test]
fn false_negative_check_catches_lossy_filter() {
    // Over the last four digits 0x1111 is a run of four, so the filter drops the real target
    let filters = FilterConfig {
        max_repeat: Some(3),
        window: Some(4),
        ..Default::default()
    };
    let chain = filters.build();
    let target = sha(0x1111);
    assert_eq!(
        first_false_negative(&chain, &Sha256Verifier, &target, &range(0x1000, 0x1fff)),
        Some(Integer::from(0x1111))
    );
    assert_eq!(
        first_false_negative(&AcceptAll, &Sha256Verifier, &target, &range(0x1000, 0x1fff)),
        None
    );

    let dir = tempfile::tempdir().unwrap();
    let report = Coordinator::new(
        config(0x1000, 0x1fff, 2),
        Arc::new(Sha256Verifier),
        Arc::new(chain),
        target,
        CheckpointStore::new(checkpoint_path(&dir)),
    )
    .run(StartMode::Resume)
    .unwrap();
    assert_eq!(report.outcome, RunOutcome::Exhausted);
}

// == Telemetry and shutdown ====================================================

/// Keeps every snapshot the coordinator pushes.
struct CollectingSink(Arc<Mutex<Vec<Snapshot>>>);

impl ProgressSink for CollectingSink {
    fn report(&mut self, snapshot: &Snapshot) {
        self.0.lock().unwrap().push(snapshot.clone());
    }
}

/// SHA-256 with a fixed delay per candidate; records what it was asked.
struct Slow {
    delay: Duration,
    seen: Arc<Mutex<Vec<Integer>>>,
}

impl Verifier for Slow {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn fingerprint_len(&self) -> usize {
        32
    }

    fn verify(&self, candidate: &Integer) -> Result<Fingerprint, VerifyError> {
        self.seen.lock().unwrap().push(candidate.clone());
        thread::sleep(self.delay);
        Sha256Verifier.verify(candidate)
    }
}

/// SHA-256 that blocks on one candidate, raising `stalled` when it does.
struct Stalling {
    stall_at: u32,
    stall: Duration,
    stalled: Arc<AtomicBool>,
}

impl Verifier for Stalling {
    fn name(&self) -> &'static str {
        "stalling"
    }

    fn fingerprint_len(&self) -> usize {
        32
    }

    fn verify(&self, candidate: &Integer) -> Result<Fingerprint, VerifyError> {
        if *candidate == self.stall_at {
            self.stalled.store(true, Ordering::SeqCst);
            thread::sleep(self.stall);
        }
        Sha256Verifier.verify(candidate)
    }
}

#[test]
fn running_scan_reports_snapshots_and_saves_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(0, 99_999, 2);
    cfg.progress_interval = 4;
    cfg.checkpoint_interval = Duration::from_millis(20);
    cfg.report_interval = Duration::from_millis(20);
    let parts = keysweep::partition(&cfg.range, 2).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancelToken::new();
    let coord = Coordinator::new(
        cfg,
        Arc::new(Slow {
            delay: Duration::from_micros(500),
            seen: Arc::clone(&seen),
        }),
        Arc::new(AcceptAll),
        sha(5_000_000),
        CheckpointStore::new(checkpoint_path(&dir)),
    )
    .with_sink(Box::new(CollectingSink(Arc::clone(&snapshots))))
    .with_cancel_token(cancel.clone());
    let handle = thread::spawn(move || coord.run(StartMode::Resume));

    // Every mid-run checkpoint must lag or equal what the workers really reached
    let store = CheckpointStore::new(checkpoint_path(&dir));
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut advanced = 0;
    while advanced < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(15));
        let Some(record) = store.load() else { continue };
        let seen = seen.lock().unwrap();
        for (w, part) in record.workers.iter().zip(&parts) {
            let cursor = seen
                .iter()
                .filter(|c| part.contains(c))
                .max()
                .map(|c| Integer::from(c + 1u32))
                .unwrap_or_else(|| part.start.clone());
            assert!(
                w.resume_from <= cursor,
                "worker {} saved at {} but only reached {}",
                w.worker_id,
                w.resume_from,
                cursor
            );
        }
        if record
            .workers
            .iter()
            .zip(&parts)
            .any(|(w, part)| w.resume_from > part.start)
        {
            advanced += 1;
        }
    }
    cancel.cancel();
    let report = handle.join().unwrap().unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(advanced > 0, "no periodic checkpoint recorded progress");

    let snapshots = snapshots.lock().unwrap();
    assert!(snapshots.len() >= 2, "got {} snapshots", snapshots.len());
    assert!(snapshots
        .windows(2)
        .all(|w| w[0].totals.examined <= w[1].totals.examined));
    // The last push is the final summary
    let last = snapshots.last().unwrap();
    assert_eq!(last.totals.examined, report.totals.examined);
    assert_eq!(last.positions, report.positions);
}

#[test]
fn stuck_worker_is_detached_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(0, 99, 1);
    cfg.progress_interval = 5;
    cfg.report_interval = Duration::from_millis(10);
    cfg.shutdown_grace = Duration::from_millis(20);

    let stalled = Arc::new(AtomicBool::new(false));
    let cancel = CancelToken::new();
    let coord = Coordinator::new(
        cfg,
        Arc::new(Stalling {
            stall_at: 12,
            stall: Duration::from_secs(3),
            stalled: Arc::clone(&stalled),
        }),
        Arc::new(AcceptAll),
        sha(5000),
        CheckpointStore::new(checkpoint_path(&dir)),
    )
    .with_cancel_token(cancel.clone());
    let handle = thread::spawn(move || coord.run(StartMode::Resume));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !stalled.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "worker never reached the stall");
        thread::sleep(Duration::from_millis(2));
    }
    cancel.cancel();
    let cancelled_at = Instant::now();
    let report = handle.join().unwrap().unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(1),
        "run waited {:?} for a stuck worker",
        cancelled_at.elapsed()
    );

    // Candidates 10 and 11 were examined but never reported
    assert_eq!(report.positions, vec![Integer::from(10)]);
    let saved = CheckpointStore::new(checkpoint_path(&dir)).load().unwrap();
    assert_eq!(saved.workers[0].resume_from, 10);
    assert_eq!(saved.workers[0].counters.examined, 10);
}
