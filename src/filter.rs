//! # Filter — Cheap Candidate Pre-Screening
//!
//! A `CandidateFilter` runs before the verifier on every candidate and decides
//! whether the expensive derivation is worth doing. Filters are stateless and
//! shared by all workers. They never move the cursor: a rejected candidate is
//! still counted as examined, only its verification is skipped.
//!
//! ## Heuristic Filters
//!
//! All heuristics look at the lowest `window` hex digits of the candidate's
//! 64-digit zero-padded form:
//!
//! - **Entropy**: Shannon entropy of the digits, in bits per digit.
//! - **Unique digits**: number of distinct hex digits.
//! - **Repeat run**: longest run of one repeated digit.
//! - **Sequence**: the whole window counts up or down by one (`3456789a...`).
//! - **Palindrome**: the window reads the same reversed.
//!
//! These heuristics can reject a real preimage. They are opt-in, and
//! `first_false_negative` exhaustively checks a subrange for exactly that
//! defect.

use rug::Integer;
use serde::{Deserialize, Serialize};

use crate::range::SearchRange;
use crate::verify::{Fingerprint, Verifier};

/// Digits examined by the heuristics unless configured otherwise.
pub const DEFAULT_WINDOW: usize = 17;

const HEX_WIDTH: usize = 64;

pub trait CandidateFilter: Send + Sync {
    fn accept(&self, candidate: &Integer) -> bool;

    /// Parameterised description, part of the run's configuration fingerprint.
    fn describe(&self) -> String;
}

/// Accepts every candidate.
pub struct AcceptAll;

impl CandidateFilter for AcceptAll {
    fn accept(&self, _candidate: &Integer) -> bool {
        true
    }

    fn describe(&self) -> String {
        "all".into()
    }
}

/// Logical AND of filters, evaluated in order; stops at the first rejection.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn CandidateFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl CandidateFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn push(&mut self, filter: Box<dyn CandidateFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl CandidateFilter for FilterChain {
    fn accept(&self, candidate: &Integer) -> bool {
        self.filters.iter().all(|f| f.accept(candidate))
    }

    fn describe(&self) -> String {
        if self.filters.is_empty() {
            return AcceptAll.describe();
        }
        self.filters
            .iter()
            .map(|f| f.describe())
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// Filter section of the run configuration. Every heuristic is off unless set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub window: Option<usize>,
    #[serde(default)]
    pub min_entropy: Option<f64>,
    #[serde(default)]
    pub min_unique: Option<usize>,
    #[serde(default)]
    pub max_repeat: Option<usize>,
    #[serde(default)]
    pub reject_sequences: bool,
    #[serde(default)]
    pub reject_palindromes: bool,
}

impl FilterConfig {
    pub fn is_active(&self) -> bool {
        self.min_entropy.is_some()
            || self.min_unique.is_some()
            || self.max_repeat.is_some()
            || self.reject_sequences
            || self.reject_palindromes
    }

    pub fn window(&self) -> usize {
        self.window.unwrap_or(DEFAULT_WINDOW).clamp(1, HEX_WIDTH)
    }

    /// Build the chain, cheapest checks first.
    pub fn build(&self) -> FilterChain {
        let window = self.window();
        let mut chain = FilterChain::new();
        if let Some(max_run) = self.max_repeat {
            chain.push(Box::new(RepeatRunFilter { max_run, window }));
        }
        if let Some(min_unique) = self.min_unique {
            chain.push(Box::new(UniqueDigitsFilter { min_unique, window }));
        }
        if self.reject_sequences {
            chain.push(Box::new(SequenceFilter { window }));
        }
        if self.reject_palindromes {
            chain.push(Box::new(PalindromeFilter { window }));
        }
        if let Some(min_entropy) = self.min_entropy {
            chain.push(Box::new(EntropyFilter {
                min_entropy,
                window,
            }));
        }
        chain
    }
}

/// Lowest `window` digits of the 64-digit zero-padded hex form.
fn hex_window(candidate: &Integer, window: usize) -> Vec<u8> {
    let hex = format!("{:0width$x}", candidate, width = HEX_WIDTH);
    let bytes = hex.into_bytes();
    let take = window.min(bytes.len());
    bytes[bytes.len() - take..].to_vec()
}

pub fn shannon_entropy(digits: &[u8]) -> f64 {
    if digits.is_empty() {
        return 0.0;
    }
    let mut freq = [0u32; 256];
    for &d in digits {
        freq[d as usize] += 1;
    }
    let total = digits.len() as f64;
    freq.iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

pub fn longest_run(digits: &[u8]) -> usize {
    let mut best = 0;
    let mut current = 0;
    let mut prev = None;
    for &d in digits {
        if Some(d) == prev {
            current += 1;
        } else {
            current = 1;
            prev = Some(d);
        }
        best = best.max(current);
    }
    best
}

fn digit_value(c: u8) -> i16 {
    match c {
        b'0'..=b'9' => (c - b'0') as i16,
        b'a'..=b'f' => (c - b'a' + 10) as i16,
        _ => -1,
    }
}

fn is_sequential(digits: &[u8], step: i16) -> bool {
    digits.len() > 1
        && digits
            .windows(2)
            .all(|w| digit_value(w[1]) - digit_value(w[0]) == step)
}

pub struct EntropyFilter {
    pub min_entropy: f64,
    pub window: usize,
}

impl CandidateFilter for EntropyFilter {
    fn accept(&self, candidate: &Integer) -> bool {
        shannon_entropy(&hex_window(candidate, self.window)) >= self.min_entropy
    }

    fn describe(&self) -> String {
        format!("entropy>={}@{}", self.min_entropy, self.window)
    }
}

pub struct UniqueDigitsFilter {
    pub min_unique: usize,
    pub window: usize,
}

impl CandidateFilter for UniqueDigitsFilter {
    fn accept(&self, candidate: &Integer) -> bool {
        let mut seen = [false; 256];
        let mut unique = 0;
        for d in hex_window(candidate, self.window) {
            if !seen[d as usize] {
                seen[d as usize] = true;
                unique += 1;
            }
        }
        unique >= self.min_unique
    }

    fn describe(&self) -> String {
        format!("unique>={}@{}", self.min_unique, self.window)
    }
}

pub struct RepeatRunFilter {
    pub max_run: usize,
    pub window: usize,
}

impl CandidateFilter for RepeatRunFilter {
    fn accept(&self, candidate: &Integer) -> bool {
        longest_run(&hex_window(candidate, self.window)) <= self.max_run
    }

    fn describe(&self) -> String {
        format!("run<={}@{}", self.max_run, self.window)
    }
}

pub struct SequenceFilter {
    pub window: usize,
}

impl CandidateFilter for SequenceFilter {
    fn accept(&self, candidate: &Integer) -> bool {
        let w = hex_window(candidate, self.window);
        !(is_sequential(&w, 1) || is_sequential(&w, -1))
    }

    fn describe(&self) -> String {
        format!("nosequence@{}", self.window)
    }
}

pub struct PalindromeFilter {
    pub window: usize,
}

impl CandidateFilter for PalindromeFilter {
    fn accept(&self, candidate: &Integer) -> bool {
        let w = hex_window(candidate, self.window);
        !w.iter().eq(w.iter().rev())
    }

    fn describe(&self) -> String {
        format!("nopalindrome@{}", self.window)
    }
}

/// Scan `range` exhaustively and return the first candidate whose fingerprint
/// equals `target` but which `filter` rejects.
///
/// Candidates the verifier cannot evaluate are skipped. Meant for small
/// subranges: every candidate is verified.
pub fn first_false_negative(
    filter: &dyn CandidateFilter,
    verifier: &dyn Verifier,
    target: &Fingerprint,
    range: &SearchRange,
) -> Option<Integer> {
    let mut n = range.start.clone();
    while n <= range.end {
        if !filter.accept(&n) {
            if let Ok(fp) = verifier.verify(&n) {
                if fp == *target {
                    return Some(n);
                }
            }
        }
        n += 1u32;
    }
    None
}
