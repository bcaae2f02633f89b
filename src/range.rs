//! # Range — Keyspace Intervals and Partitioning
//!
//! A `SearchRange` is a closed interval `[start, end]` over non-negative
//! integers of arbitrary width (`rug::Integer`), wide enough for a full
//! 256-bit keyspace. `partition` splits one range into N contiguous,
//! disjoint sub-ranges whose sizes differ by at most one; the remainder is
//! handed out one candidate at a time to the last partitions.
//!
//! Partitioning is a pure function: the same range and worker count always
//! produce the same sub-ranges. Checkpoint resume relies on this to validate
//! stored positions against freshly computed ranges.
//!
//! Integers are written as `0x`-prefixed lowercase hex everywhere they leave
//! the process (checkpoint JSON, TOML, logs).

use rug::Integer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Closed interval of candidates. Invariant: `start <= end`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRange {
    #[serde(with = "hex_int")]
    pub start: Integer,
    #[serde(with = "hex_int")]
    pub end: Integer,
}

impl SearchRange {
    pub fn new(start: Integer, end: Integer) -> Result<Self, ConfigError> {
        if start < 0 {
            return Err(ConfigError::InvalidRange(format!(
                "start {} is negative",
                start
            )));
        }
        if start > end {
            return Err(ConfigError::InvalidRange(format!(
                "start {} is greater than end {}",
                to_hex(&start),
                to_hex(&end)
            )));
        }
        Ok(SearchRange { start, end })
    }

    /// Number of candidates, `end - start + 1`.
    pub fn len(&self) -> Integer {
        Integer::from(&self.end - &self.start) + 1u32
    }

    pub fn contains(&self, n: &Integer) -> bool {
        *n >= self.start && *n <= self.end
    }

    /// The position an exhausted scan of this range stops at.
    pub fn past_end(&self) -> Integer {
        Integer::from(&self.end + 1u32)
    }
}

impl fmt::Display for SearchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", to_hex(&self.start), to_hex(&self.end))
    }
}

/// Parses `START:END`, both hex, inclusive.
impl FromStr for SearchRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.split_once(':').ok_or_else(|| {
            ConfigError::InvalidRange(format!("expected START:END in hex, got {:?}", s))
        })?;
        SearchRange::new(parse_hex(start)?, parse_hex(end)?)
    }
}

/// One worker's share of the keyspace and where it picks up.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerAssignment {
    pub worker_id: usize,
    pub range: SearchRange,
    /// Next candidate to examine; `range.end + 1` once exhausted.
    pub resume_from: Integer,
}

impl WorkerAssignment {
    pub fn fresh(worker_id: usize, range: SearchRange) -> Self {
        let resume_from = range.start.clone();
        WorkerAssignment {
            worker_id,
            range,
            resume_from,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.resume_from > self.range.end
    }
}

/// Split `range` into `workers` contiguous sub-ranges.
///
/// Sizes differ by at most one; the last `len % workers` partitions take one
/// extra candidate each. Fails when `workers` is zero or exceeds the number of
/// candidates (a partition would be empty).
pub fn partition(range: &SearchRange, workers: usize) -> Result<Vec<SearchRange>, ConfigError> {
    if workers == 0 {
        return Err(ConfigError::ZeroWorkers);
    }
    if range.start > range.end {
        return Err(ConfigError::InvalidRange(format!(
            "start {} is greater than end {}",
            to_hex(&range.start),
            to_hex(&range.end)
        )));
    }

    let len = range.len();
    if len < workers as u64 {
        return Err(ConfigError::InvalidSetting {
            name: "workers",
            reason: format!("{} workers for a range of only {} candidates", workers, len),
        });
    }

    let (base, rem) = len.div_rem(Integer::from(workers as u64));
    // rem < workers, so it fits in usize
    let rem = rem.to_usize_wrapping();
    let first_bigger = workers - rem;

    let mut parts = Vec::with_capacity(workers);
    let mut cursor = range.start.clone();
    for i in 0..workers {
        let size = if i >= first_bigger {
            Integer::from(&base + 1u32)
        } else {
            base.clone()
        };
        let end = Integer::from(&cursor + &size) - 1u32;
        let next = Integer::from(&end + 1u32);
        parts.push(SearchRange { start: cursor, end });
        cursor = next;
    }

    Ok(parts)
}

/// Fresh assignments for every partition.
pub fn assign(range: &SearchRange, workers: usize) -> Result<Vec<WorkerAssignment>, ConfigError> {
    Ok(partition(range, workers)?
        .into_iter()
        .enumerate()
        .map(|(id, r)| WorkerAssignment::fresh(id, r))
        .collect())
}

/// Parse a non-negative hex integer, `0x` prefix optional.
pub fn parse_hex(s: &str) -> Result<Integer, ConfigError> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidRange(format!(
            "{:?} is not a hex integer",
            s
        )));
    }
    Integer::from_str_radix(digits, 16)
        .map_err(|e| ConfigError::InvalidRange(format!("{:?}: {}", s, e)))
}

/// `0x`-prefixed lowercase hex.
pub fn to_hex(n: &Integer) -> String {
    format!("{:#x}", n)
}

/// Serde adapter storing `Integer` as a hex string.
pub mod hex_int {
    use rug::Integer;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &Integer, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::to_hex(n))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Integer, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_hex(&raw).map_err(serde::de::Error::custom)
    }
}
