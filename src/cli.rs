//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Contains the
//! execution logic for each subcommand: settings merge (flags over config file
//! over defaults), scan dispatch with Ctrl-C handling, the throughput
//! benchmark, checkpoint inspection.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use keysweep::checkpoint::CheckpointStore;
use keysweep::config::{secs, ConfigFile, RunConfig};
use keysweep::coordinator::{Coordinator, RunOutcome, StartMode};
use keysweep::events::Counters;
use keysweep::filter::CandidateFilter;
use keysweep::progress::{format_hms, Snapshot, TracingSink};
use keysweep::range::{parse_hex, partition, to_hex, SearchRange};
use keysweep::verify::{self, Fingerprint, Verifier, BUILTIN_VERIFIERS};
use keysweep::CancelToken;
use rug::Integer;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::{BenchArgs, Cli, ScanArgs};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_EXHAUSTED: u8 = 2;
pub const EXIT_CANCELLED: u8 = 130;

const DEFAULT_CHECKPOINT: &str = "keysweep.checkpoint";
const DEFAULT_VERIFIER: &str = "hash160";
/// Fixed secret the throughput benchmark counts up from.
const BENCH_KEY: &str = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2";

// ── Settings ────────────────────────────────────────────────────

fn load_config_file(cli: &Cli) -> Result<ConfigFile> {
    match &cli.config {
        Some(path) => ConfigFile::load(path)
            .with_context(|| format!("failed to read config file {}", path.display())),
        None => Ok(ConfigFile::default()),
    }
}

fn checkpoint_path(cli: &Cli, file: &ConfigFile) -> PathBuf {
    cli.checkpoint
        .clone()
        .or_else(|| file.checkpoint.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT))
}

fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Logical cores, but never more workers than candidates.
fn default_workers(range: &SearchRange) -> usize {
    let len = range.len().to_usize().unwrap_or(usize::MAX);
    logical_cores().min(len).max(1)
}

fn builtin_verifier(name: &str) -> Result<Box<dyn Verifier>> {
    verify::by_name(name).with_context(|| {
        format!(
            "unknown verifier {:?} (available: {})",
            name,
            BUILTIN_VERIFIERS.join(", ")
        )
    })
}

fn parse_range(start: &str, end: &str) -> Result<SearchRange> {
    let start = parse_hex(start).context("invalid start")?;
    let end = parse_hex(end).context("invalid end")?;
    Ok(SearchRange::new(start, end)?)
}

/// Overlay flags on the config file on the defaults.
fn build_config(args: &ScanArgs, file: &ConfigFile) -> Result<RunConfig> {
    let start = args
        .start
        .as_deref()
        .or(file.start.as_deref())
        .context("a start is required (--start, KEYSWEEP_START or the config file)")?;
    let end = args
        .end
        .as_deref()
        .or(file.end.as_deref())
        .context("an end is required (--end, KEYSWEEP_END or the config file)")?;
    let range = parse_range(start, end)?;

    let workers = args
        .workers
        .or(file.workers)
        .unwrap_or_else(|| default_workers(&range));
    let mut config = RunConfig::new(range, workers);

    if let Some(s) = args.checkpoint_interval.or(file.checkpoint_interval) {
        config.checkpoint_interval = secs(s, "checkpoint_interval")?;
    }
    if let Some(s) = args.report_interval.or(file.report_interval) {
        config.report_interval = secs(s, "report_interval")?;
    }
    if let Some(s) = args.shutdown_grace.or(file.shutdown_grace) {
        config.shutdown_grace = secs(s, "shutdown_grace")?;
    }
    if let Some(n) = args.progress_interval.or(file.progress_interval) {
        config.progress_interval = n;
    }
    if let Some(n) = args.error_threshold.or(file.error_threshold) {
        config.error_threshold = n;
    }
    if let Some(n) = args.channel_capacity.or(file.channel_capacity) {
        config.channel_capacity = n;
    }
    if let Some(p) = args.failure_policy.or(file.failure_policy) {
        config.failure_policy = p;
    }

    let mut filters = file.filters.clone();
    if args.filter_window.is_some() {
        filters.window = args.filter_window;
    }
    if args.min_entropy.is_some() {
        filters.min_entropy = args.min_entropy;
    }
    if args.min_unique.is_some() {
        filters.min_unique = args.min_unique;
    }
    if args.max_repeat.is_some() {
        filters.max_repeat = args.max_repeat;
    }
    filters.reject_sequences |= args.reject_sequences;
    filters.reject_palindromes |= args.reject_palindromes;
    config.filters = filters;

    config.validate()?;
    Ok(config)
}

// ── Scan ────────────────────────────────────────────────────────

/// Run the engine and map its outcome to an exit code.
pub fn run_scan(cli: &Cli, args: &ScanArgs) -> Result<u8> {
    let file = load_config_file(cli)?;
    let config = build_config(args, &file)?;

    let name = args
        .verifier
        .clone()
        .or_else(|| file.verifier.clone())
        .unwrap_or_else(|| DEFAULT_VERIFIER.to_string());
    let verifier: Arc<dyn Verifier> = builtin_verifier(&name)?.into();
    verifier
        .self_check()
        .with_context(|| format!("{} verifier failed its self-check", name))?;

    let target_text = args
        .target
        .as_deref()
        .or(file.target.as_deref())
        .context("a target is required (--target, KEYSWEEP_TARGET or the config file)")?;
    let target = verifier
        .parse_target(target_text)
        .with_context(|| format!("invalid target {:?}", target_text))?;

    let chain = config.filters.build();
    if config.filters.is_active() {
        warn!(
            filter = %chain.describe(),
            "heuristic filters enabled: rejected candidates are never verified and the target can be missed"
        );
    }
    let filter: Arc<dyn CandidateFilter> = Arc::new(chain);

    let store = CheckpointStore::new(checkpoint_path(cli, &file));
    let checkpoint_display = store.path().display().to_string();

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, stopping workers");
            cancel.cancel();
        })
        .context("failed to install signal handler")?;
    }

    let mode = if args.fresh {
        StartMode::Fresh
    } else {
        StartMode::Resume
    };
    let report = Coordinator::new(config, Arc::clone(&verifier), filter, target, store)
        .with_sink(Box::new(TracingSink {
            per_worker: args.per_worker_progress,
        }))
        .with_cancel_token(cancel)
        .run(mode)?;

    match &report.outcome {
        RunOutcome::Found {
            worker_id,
            candidate,
            fingerprint,
        } => {
            println!("found: {}", to_hex(candidate));
            println!("fingerprint: {}", fingerprint);
            let address = address_for(verifier.name(), fingerprint);
            if let Some(addr) = &address {
                println!("address: {}", addr);
            }
            let wif = wif_for(verifier.name(), candidate);
            if let Some(wif) = &wif {
                println!("wif: {}", wif);
            }
            if let Some(path) = &args.found_file {
                let line = serde_json::json!({
                    "candidate": to_hex(candidate),
                    "fingerprint": fingerprint.to_hex(),
                    "address": address,
                    "wif": wif,
                    "verifier": verifier.name(),
                    "worker_id": worker_id,
                    "examined": report.totals.examined,
                    "found_at": Utc::now().to_rfc3339(),
                });
                // The match is already on stdout; a write failure must not hide it
                match append_line(path, &line.to_string()) {
                    Ok(()) => info!(path = %path.display(), "match recorded"),
                    Err(e) => error!(path = %path.display(), error = %e, "could not record match"),
                }
            }
            Ok(EXIT_OK)
        }
        RunOutcome::Exhausted => {
            println!(
                "exhausted: target not in range ({} candidates examined, {} filtered)",
                report.totals.examined, report.totals.filtered
            );
            Ok(EXIT_EXHAUSTED)
        }
        RunOutcome::Failed { worker_id, error } => {
            eprintln!(
                "failed: worker {} stopped: {} (checkpoint kept at {})",
                worker_id, error, checkpoint_display
            );
            Ok(EXIT_FAILED)
        }
        RunOutcome::Cancelled => {
            println!(
                "cancelled: progress saved to {}; rerun with the same settings to resume",
                checkpoint_display
            );
            Ok(EXIT_CANCELLED)
        }
    }
}

fn address_for(verifier: &str, fingerprint: &Fingerprint) -> Option<String> {
    if verifier == "hash160" {
        verify::p2pkh_address(fingerprint)
    } else {
        None
    }
}

fn wif_for(verifier: &str, candidate: &Integer) -> Option<String> {
    if verifier == "hash160" {
        verify::wif_compressed(candidate)
    } else {
        None
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", line)?;
    f.sync_all()
}

// ── Bench ───────────────────────────────────────────────────────

/// Time one verifier on a single thread, then project that rate over the
/// worker count and, given a range, over the whole range.
pub fn run_bench(args: &BenchArgs) -> Result<()> {
    let name = args.verifier.as_deref().unwrap_or(DEFAULT_VERIFIER);
    let verifier = builtin_verifier(name)?;
    let window = secs(args.duration, "duration")?;
    let workers = args.workers.unwrap_or_else(logical_cores).max(1);

    let mut candidate = parse_hex(BENCH_KEY)?;
    let mut count: u64 = 0;
    let started = Instant::now();
    while count == 0 || started.elapsed() < window {
        verifier
            .verify(&candidate)
            .with_context(|| format!("{} failed on {}", name, to_hex(&candidate)))?;
        candidate += 1u32;
        count += 1;
    }
    let elapsed = started.elapsed();
    debug!(verifier = name, count, elapsed_secs = elapsed.as_secs_f64(), "benchmark done");

    let (len, range) = match (&args.start, &args.end) {
        (Some(start), Some(end)) => {
            let range = parse_range(start, end)?;
            (range.len(), Some(range))
        }
        _ => (Integer::new(), None),
    };
    let single = Snapshot::compute(Counters::default(), count, elapsed, &len, &len, Vec::new());
    let projected = Snapshot::compute(
        Counters::default(),
        count.saturating_mul(workers as u64),
        elapsed,
        &len,
        &len,
        Vec::new(),
    );

    println!("verifier:    {}", name);
    println!(
        "measured:    {} candidates in {:.2}s",
        count,
        elapsed.as_secs_f64()
    );
    println!("per worker:  {:.0} candidates/sec", single.rate);
    println!(
        "projected:   ~{:.0} candidates/sec ({} workers)",
        projected.rate, workers
    );
    if let Some(range) = range {
        println!("range:       {} ({} candidates)", range, len);
        match projected.eta {
            Some(eta) => println!("eta:         {}", format_hms(eta)),
            None => println!("eta:         beyond any practical time"),
        }
    }
    Ok(())
}

// ── Partition / Inspect / Reset ─────────────────────────────────

pub fn run_partition(start: &str, end: &str, workers: usize) -> Result<()> {
    let range = parse_range(start, end)?;
    let parts = partition(&range, workers)?;
    println!("range {} ({} candidates, {} workers)", range, range.len(), workers);
    for (id, part) in parts.iter().enumerate() {
        println!(
            "worker {:>3}  {}  {}  {}",
            id,
            to_hex(&part.start),
            to_hex(&part.end),
            part.len()
        );
    }
    Ok(())
}

pub fn run_inspect(cli: &Cli) -> Result<()> {
    let file = load_config_file(cli)?;
    let store = CheckpointStore::new(checkpoint_path(cli, &file));
    let Some(record) = store.load() else {
        if store.exists() {
            bail!(
                "checkpoint {} is unreadable or corrupt; a scan would start fresh",
                store.path().display()
            );
        }
        println!("no checkpoint at {}", store.path().display());
        return Ok(());
    };

    let totals = record.totals();
    println!("checkpoint:  {}", store.path().display());
    println!("config:      {}", record.config_fingerprint);
    println!("range:       {}", record.range);
    println!("started:     {}", record.started_at.to_rfc3339());
    println!("saved:       {}", record.saved_at.to_rfc3339());
    println!(
        "examined:    {} (filtered {}, errors {})",
        totals.examined, totals.filtered, totals.errors
    );
    println!("remaining:   {}", record.remaining());
    println!("progress:    {:.6}%", record.percent_done());
    for w in &record.workers {
        println!(
            "worker {:>3}  {}  at {}  examined {}",
            w.worker_id,
            w.range,
            to_hex(&w.resume_from),
            w.counters.examined
        );
    }
    Ok(())
}

pub fn run_reset(cli: &Cli) -> Result<()> {
    let file = load_config_file(cli)?;
    let store = CheckpointStore::new(checkpoint_path(cli, &file));
    if store.exists() {
        store.clear();
        println!("removed {}", store.path().display());
    } else {
        println!("no checkpoint at {}", store.path().display());
    }
    Ok(())
}
