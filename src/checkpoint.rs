//! # Checkpoint — Resumable Scan State Persistence
//!
//! Saves and loads per-worker resume positions and counters as a single JSON
//! file with SHA-256 integrity verification.
//!
//! ## Atomic Writes
//!
//! Checkpoint files are written atomically: write to `<path>.tmp`, fsync, then
//! rename over `<path>`. A reader never observes a partially written
//! checkpoint. Saves through one store are serialized.
//!
//! ## Integrity
//!
//! The record is wrapped in an envelope carrying a format version and the
//! SHA-256 of the serialized record. On load, anything unexpected (missing
//! file, truncated JSON, checksum mismatch, unknown version) is reported as
//! "no checkpoint" rather than an error: a damaged checkpoint must never stop
//! a run from starting.
//!
//! ## Validity
//!
//! A loaded record is only usable by the run whose configuration fingerprint
//! it carries. The coordinator checks that; this module only stores bytes.

use chrono::{DateTime, Utc};
use rug::Integer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::CheckpointError;
use crate::events::Counters;
use crate::range::{hex_int, SearchRange};

/// Checkpoint format version.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCheckpoint {
    pub worker_id: usize,
    pub range: SearchRange,
    /// Next candidate to examine; `range.end + 1` once exhausted.
    #[serde(with = "hex_int")]
    pub resume_from: Integer,
    pub counters: Counters,
}

impl WorkerCheckpoint {
    /// Candidates left in this worker's range.
    pub fn remaining(&self) -> Integer {
        let left = Integer::from(&self.range.past_end() - &self.resume_from);
        if left < 0 {
            Integer::new()
        } else {
            left
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub config_fingerprint: String,
    pub range: SearchRange,
    /// Indexed by worker id.
    pub workers: Vec<WorkerCheckpoint>,
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn totals(&self) -> Counters {
        self.workers
            .iter()
            .fold(Counters::default(), |acc, w| acc + w.counters)
    }

    pub fn remaining(&self) -> Integer {
        self.workers.iter().map(|w| w.remaining()).sum()
    }

    /// Share of the range already covered, 0–100.
    pub fn percent_done(&self) -> f64 {
        let total = self.range.len();
        let done = Integer::from(&total - &self.remaining());
        done.to_f64() / total.to_f64() * 100.0
    }
}

/// Wrapper that includes a SHA-256 checksum for integrity verification.
#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope {
    version: u32,
    checksum: String,
    data: serde_json::Value,
}

/// Compute SHA-256 hex digest of a string.
fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct CheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut p = self.path.as_os_str().to_os_string();
        p.push(".tmp");
        PathBuf::from(p)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write `record` atomically, replacing any previous checkpoint.
    pub fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let data = serde_json::to_value(record)?;
        let checksum = sha256_hex(&serde_json::to_string(&data)?);
        let envelope = CheckpointEnvelope {
            version: FORMAT_VERSION,
            checksum,
            data,
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        let tmp = self.tmp_path();
        let result = write_synced(&tmp, json.as_bytes()).and_then(|_| fs::rename(&tmp, &self.path));
        if result.is_err() {
            if let Err(e) = fs::remove_file(&tmp) {
                debug!(path = %tmp.display(), error = %e, "temp checkpoint not removed");
            }
        }
        result?;

        debug!(path = %self.path.display(), "checkpoint saved");
        Ok(())
    }

    /// Load the checkpoint, or `None` if it is absent or unusable.
    pub fn load(&self) -> Option<CheckpointRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint unreadable, ignoring");
                return None;
            }
        };

        let envelope: CheckpointEnvelope = match serde_json::from_str(&raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint corrupt, ignoring");
                return None;
            }
        };

        if envelope.version != FORMAT_VERSION {
            warn!(
                path = %self.path.display(),
                version = envelope.version,
                expected = FORMAT_VERSION,
                "checkpoint format unsupported, ignoring"
            );
            return None;
        }

        let expected = serde_json::to_string(&envelope.data)
            .map(|s| sha256_hex(&s))
            .ok()?;
        if expected != envelope.checksum {
            warn!(
                path = %self.path.display(),
                expected = abbreviate(&expected),
                got = abbreviate(&envelope.checksum),
                "checkpoint integrity check failed, ignoring"
            );
            return None;
        }

        match serde_json::from_value(envelope.data) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint record invalid, ignoring");
                None
            }
        }
    }

    /// Remove the checkpoint and any leftover temp file.
    pub fn clear(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        for p in [self.path.clone(), self.tmp_path()] {
            match fs::remove_file(&p) {
                Ok(()) => debug!(path = %p.display(), "checkpoint removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %p.display(), error = %e, "could not remove checkpoint"),
            }
        }
    }
}

/// First 12 bytes of a digest for log lines; the whole string when that
/// would split a character.
pub(crate) fn abbreviate(s: &str) -> &str {
    s.get(..12).unwrap_or(s)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = fs::File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CheckpointRecord {
        let range = SearchRange::new(Integer::from(0), Integer::from(199)).unwrap();
        let now = Utc::now();
        CheckpointRecord {
            config_fingerprint: "ab".repeat(32),
            range: range.clone(),
            workers: vec![
                WorkerCheckpoint {
                    worker_id: 0,
                    range: SearchRange::new(Integer::from(0), Integer::from(99)).unwrap(),
                    resume_from: Integer::from(40),
                    counters: Counters {
                        examined: 40,
                        filtered: 3,
                        errors: 1,
                    },
                },
                WorkerCheckpoint {
                    worker_id: 1,
                    range: SearchRange::new(Integer::from(100), Integer::from(199)).unwrap(),
                    resume_from: Integer::from(200),
                    counters: Counters {
                        examined: 100,
                        filtered: 0,
                        errors: 0,
                    },
                },
            ],
            started_at: now,
            saved_at: now,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("scan.checkpoint"));

        let rec = record();
        store.save(&rec).unwrap();
        assert_eq!(store.load().unwrap(), rec);
    }

    #[test]
    fn save_overwrites_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("scan.checkpoint"));

        let mut rec = record();
        store.save(&rec).unwrap();
        rec.workers[0].resume_from = Integer::from(77);
        store.save(&rec).unwrap();

        assert_eq!(store.load().unwrap().workers[0].resume_from, 77);
        assert!(!store.tmp_path().exists());
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent.checkpoint"));
        assert!(store.load().is_none());
        assert!(!store.exists());
    }

    #[test]
    fn truncated_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("scan.checkpoint"));
        store.save(&record()).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), &raw[..raw.len() / 2]).unwrap();
        assert!(store.load().is_none());

        fs::write(store.path(), "").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn checksum_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("scan.checkpoint"));
        store.save(&record()).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), raw.replace("\"0x28\"", "\"0x29\"")).unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn non_ascii_checksum_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("scan.checkpoint"));
        store.save(&record()).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
        envelope["checksum"] = "aéééééééé".into();
        fs::write(store.path(), envelope.to_string()).unwrap();

        // With a subscriber installed the warning fields are actually rendered
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let loaded = tracing::subscriber::with_default(subscriber, || store.load());
        assert!(loaded.is_none());
    }

    #[test]
    fn abbreviate_respects_char_boundaries() {
        assert_eq!(abbreviate("0123456789abcdef"), "0123456789ab");
        assert_eq!(abbreviate("abc"), "abc");
        assert_eq!(abbreviate("aéééééééé"), "aéééééééé");
    }

    #[test]
    fn unknown_version_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("scan.checkpoint"));
        store.save(&record()).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), raw.replace("\"version\": 1", "\"version\": 99")).unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("scan.checkpoint"));
        store.save(&record()).unwrap();
        fs::write(store.tmp_path(), "leftover").unwrap();

        store.clear();
        assert!(!store.exists());
        assert!(!store.tmp_path().exists());
        store.clear();
    }

    #[test]
    fn save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("no/such/dir/scan.checkpoint"));
        assert!(matches!(store.save(&record()), Err(CheckpointError::Io(_))));
    }

    #[test]
    fn progress_figures() {
        let rec = record();
        assert_eq!(rec.totals().examined, 140);
        assert_eq!(rec.remaining(), 60);
        assert!((rec.percent_done() - 70.0).abs() < 1e-9);
        assert_eq!(rec.workers[1].remaining(), 0);
    }

    #[test]
    fn integers_stored_as_hex() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("scan.checkpoint"));
        store.save(&record()).unwrap();
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"resume_from\": \"0x28\""));
        assert!(raw.contains("\"end\": \"0xc7\""));
    }
}
