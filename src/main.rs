//! # Main — CLI Entry Point
//!
//! Parses the command line and routes subcommands to `cli.rs`. Handles the
//! shared concerns: `.env` loading, logging setup and exit codes.
//!
//! ## Subcommands
//!
//! - `scan`: run the engine over a range until the target is found, the range
//!   is exhausted, a worker fails or the run is interrupted.
//! - `bench`: time a verifier and project the scan rate and ETA.
//! - `partition`: print how a range splits between workers.
//! - `inspect`: summarize the checkpoint file.
//! - `reset`: delete the checkpoint file.
//!
//! ## Global Options
//!
//! - `--config` / `KEYSWEEP_CONFIG`: TOML file with run settings. Flags win.
//! - `--checkpoint` / `KEYSWEEP_CHECKPOINT`: checkpoint path (default
//!   `keysweep.checkpoint`).
//!
//! ## Exit Codes
//!
//! 0 found, 1 failed or error, 2 exhausted, 130 cancelled.

mod cli;

use clap::{Args, Parser, Subcommand};
use keysweep::config::FailurePolicy;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "keysweep",
    version,
    about = "Search a numeric keyspace for the preimage of a target fingerprint"
)]
struct Cli {
    /// TOML file with run settings; command-line flags override it
    #[arg(long, global = true, env = "KEYSWEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Path to checkpoint file for resuming scans [default: keysweep.checkpoint]
    #[arg(long, global = true, env = "KEYSWEEP_CHECKPOINT")]
    checkpoint: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a range for the candidate whose fingerprint equals the target
    Scan(ScanArgs),
    /// Measure verifier throughput and estimate how long a range takes
    Bench(BenchArgs),
    /// Print the sub-range each worker would scan
    Partition {
        /// First candidate (hex)
        #[arg(long)]
        start: String,
        /// Last candidate, inclusive (hex)
        #[arg(long)]
        end: String,
        /// Number of workers
        #[arg(long)]
        workers: usize,
    },
    /// Summarize the checkpoint file
    Inspect,
    /// Delete the checkpoint file
    Reset,
}

#[derive(Args)]
struct BenchArgs {
    /// Verifier to time: hash160 or sha256 [default: hash160]
    #[arg(long)]
    verifier: Option<String>,

    /// Workers to project the rate for [default: logical cores]
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds to measure for
    #[arg(long, default_value_t = 2.0)]
    duration: f64,

    /// First candidate of a range to estimate (hex)
    #[arg(long, requires = "end")]
    start: Option<String>,

    /// Last candidate of that range, inclusive (hex)
    #[arg(long, requires = "start")]
    end: Option<String>,
}

#[derive(Args, Default)]
struct ScanArgs {
    /// First candidate (hex)
    #[arg(long, env = "KEYSWEEP_START")]
    start: Option<String>,

    /// Last candidate, inclusive (hex)
    #[arg(long, env = "KEYSWEEP_END")]
    end: Option<String>,

    /// Number of workers [default: logical cores]
    #[arg(long, env = "KEYSWEEP_WORKERS")]
    workers: Option<usize>,

    /// Target fingerprint (hex), or a P2PKH address for hash160
    #[arg(long, env = "KEYSWEEP_TARGET")]
    target: Option<String>,

    /// Verifier: hash160 or sha256 [default: hash160]
    #[arg(long, env = "KEYSWEEP_VERIFIER")]
    verifier: Option<String>,

    /// Seconds between checkpoint saves [default: 60]
    #[arg(long)]
    checkpoint_interval: Option<f64>,

    /// Candidates between worker progress events [default: 100000]
    #[arg(long)]
    progress_interval: Option<u64>,

    /// Seconds between progress reports [default: 30]
    #[arg(long)]
    report_interval: Option<f64>,

    /// Consecutive verifier errors before a worker fails [default: 100]
    #[arg(long)]
    error_threshold: Option<u32>,

    /// Seconds to wait for workers after cancellation [default: 10]
    #[arg(long)]
    shutdown_grace: Option<f64>,

    /// Buffered progress events before the oldest are dropped [default: 1024]
    #[arg(long)]
    channel_capacity: Option<usize>,

    /// What to do when a worker fails: abort or continue [default: abort]
    #[arg(long)]
    failure_policy: Option<FailurePolicy>,

    /// Skip candidates whose digit entropy (bits) is below this
    #[arg(long)]
    min_entropy: Option<f64>,

    /// Skip candidates with fewer distinct hex digits than this
    #[arg(long)]
    min_unique: Option<usize>,

    /// Skip candidates with a run of identical digits longer than this
    #[arg(long)]
    max_repeat: Option<usize>,

    /// Skip candidates containing long ascending or descending digit runs
    #[arg(long)]
    reject_sequences: bool,

    /// Skip candidates whose digits read the same backwards
    #[arg(long)]
    reject_palindromes: bool,

    /// Number of trailing hex digits the filters look at [default: 17]
    #[arg(long)]
    filter_window: Option<usize>,

    /// Discard any existing checkpoint and start from the beginning
    #[arg(long)]
    fresh: bool,

    /// Append a JSON line describing the match to this file
    #[arg(long, env = "KEYSWEEP_FOUND_FILE")]
    found_file: Option<PathBuf>,

    /// Also log every worker's position with each progress report
    #[arg(long)]
    per_worker_progress: bool,
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for log shippers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Scan(args) => cli::run_scan(&cli, args),
        Commands::Bench(args) => cli::run_bench(args).map(|_| cli::EXIT_OK),
        Commands::Partition {
            start,
            end,
            workers,
        } => cli::run_partition(start, end, *workers).map(|_| cli::EXIT_OK),
        Commands::Inspect => cli::run_inspect(&cli).map(|_| cli::EXIT_OK),
        Commands::Reset => cli::run_reset(&cli).map(|_| cli::EXIT_OK),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(cli::EXIT_FAILED)
        }
    }
}
