//! # Errors — Typed Failure Taxonomy
//!
//! | Type | Scope | Handling |
//! |------|-------|----------|
//! | `ConfigError` | startup | fatal, no worker is launched |
//! | `VerifyError` | one candidate | counted and skipped by the worker |
//! | `TargetError` | startup | fatal, bad `--target` |
//! | `CheckpointError` | checkpoint save | logged, retried next interval |
//!
//! Systemic worker failures travel as `TerminalEvent::Failed` and cancellation
//! is an outcome, not an error, so neither has a type here.

use thiserror::Error;

/// Invalid run configuration. Raised before any worker starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("checkpoint mismatch: {0} (use --fresh or `keysweep reset` to discard it)")]
    CheckpointMismatch(String),

    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure to evaluate a single candidate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("malformed candidate {candidate}: {reason}")]
    MalformedCandidate { candidate: String, reason: String },

    #[error("derivation failed: {0}")]
    Derivation(String),

    #[error("verifier panicked: {0}")]
    Panicked(String),
}

/// Target fingerprint could not be parsed for the selected verifier.
#[derive(Error, Debug, PartialEq)]
pub enum TargetError {
    #[error("target is empty")]
    Empty,

    #[error("invalid hex target: {0}")]
    Hex(String),

    #[error("target is {got} bytes, verifier `{verifier}` produces {expected}")]
    Length {
        verifier: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid address: {0}")]
    Address(String),
}

/// Checkpoint could not be written.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
