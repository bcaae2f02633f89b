//! # Config — Run Configuration, TOML Loading, Fingerprinting
//!
//! `RunConfig` is immutable for the duration of a run. It can be assembled
//! from a TOML file (`ConfigFile`) overlaid with command-line flags; the
//! merge itself lives in the binary.
//!
//! ## Fingerprint
//!
//! A checkpoint is only valid for the run that wrote it. The configuration
//! fingerprint is a SHA-256 over the canonical JSON of everything that decides
//! which candidates get examined and how they are split between workers:
//! range, worker count, filter description, verifier name and target.
//! Intervals, grace period, channel capacity and failure policy are
//! operational knobs; changing them between runs keeps the checkpoint valid.
//!
//! ## Example
//!
//! ```toml
//! start = "0x780000000000000000"
//! end = "0x7fffffffffffffffff"
//! workers = 12
//! verifier = "hash160"
//! target = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"
//! checkpoint_interval = 60
//! failure_policy = "abort"
//!
//! [filters]
//! max_repeat = 5
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::filter::FilterConfig;
use crate::range::{to_hex, SearchRange};
use crate::verify::Fingerprint;

pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100_000;
pub const DEFAULT_ERROR_THRESHOLD: u32 = 100;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Bumped whenever the fingerprint's inputs change shape.
const FINGERPRINT_VERSION: u32 = 1;

/// What the coordinator does when one worker fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Cancel every worker and end the run as Failed.
    #[default]
    Abort,
    /// Keep the remaining workers scanning; the run still ends Failed unless
    /// someone finds the target.
    Continue,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Abort => write!(f, "abort"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(FailurePolicy::Abort),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(format!(
                "unknown failure policy {:?} (expected abort or continue)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub range: SearchRange,
    pub workers: usize,
    /// Wall-clock time between checkpoint writes.
    pub checkpoint_interval: Duration,
    /// Candidates a worker examines between progress events.
    pub progress_interval: u64,
    /// Wall-clock time between progress snapshots.
    pub report_interval: Duration,
    pub filters: FilterConfig,
    /// Consecutive verifier errors tolerated before a worker fails.
    pub error_threshold: u32,
    /// How long to wait for workers to stop after cancellation.
    pub shutdown_grace: Duration,
    /// Bound of the progress event lane.
    pub channel_capacity: usize,
    pub failure_policy: FailurePolicy,
}

impl RunConfig {
    pub fn new(range: SearchRange, workers: usize) -> Self {
        RunConfig {
            range,
            workers,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            filters: FilterConfig::default(),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.range.start < 0 || self.range.start > self.range.end {
            return Err(ConfigError::InvalidRange(format!(
                "{} is not a valid START:END",
                self.range
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.range.len() < self.workers as u64 {
            return Err(ConfigError::InvalidSetting {
                name: "workers",
                reason: format!(
                    "{} workers for a range of only {} candidates",
                    self.workers,
                    self.range.len()
                ),
            });
        }
        if self.progress_interval == 0 {
            return Err(setting("progress_interval", "must be at least 1"));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(setting("checkpoint_interval", "must be positive"));
        }
        if self.report_interval.is_zero() {
            return Err(setting("report_interval", "must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(setting("channel_capacity", "must be at least 1"));
        }
        if let Some(w) = self.filters.window {
            if w == 0 || w > 64 {
                return Err(setting("filters.window", "must be between 1 and 64"));
            }
        }
        if let Some(e) = self.filters.min_entropy {
            if !(0.0..=4.0).contains(&e) {
                return Err(setting("filters.min_entropy", "must be between 0 and 4"));
            }
        }
        Ok(())
    }

    /// Fingerprint identifying the candidate set and its partitioning.
    pub fn fingerprint(&self, verifier: &str, filter: &str, target: &Fingerprint) -> String {
        // serde_json maps are sorted by key, so this is canonical
        let canonical = serde_json::json!({
            "version": FINGERPRINT_VERSION,
            "start": to_hex(&self.range.start),
            "end": to_hex(&self.range.end),
            "workers": self.workers,
            "filter": filter,
            "verifier": verifier,
            "target": target.to_hex(),
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn setting(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        name,
        reason: reason.to_string(),
    }
}

/// Optional settings read from a TOML file. Durations are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub start: Option<String>,
    pub end: Option<String>,
    pub workers: Option<usize>,
    pub verifier: Option<String>,
    pub target: Option<String>,
    pub checkpoint: Option<PathBuf>,
    pub checkpoint_interval: Option<f64>,
    pub progress_interval: Option<u64>,
    pub report_interval: Option<f64>,
    pub error_threshold: Option<u32>,
    pub shutdown_grace: Option<f64>,
    pub channel_capacity: Option<usize>,
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub filters: FilterConfig,
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

/// Seconds as given in a config file or flag.
pub fn secs(value: f64, name: &'static str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidSetting {
        name,
        reason: format!("{} is not a valid number of seconds", value),
    })
}
