//! # Verify — Expensive Candidate Fingerprinting
//!
//! A `Verifier` maps a candidate to a fixed-length fingerprint. The engine
//! compares it to the target by exact byte equality and otherwise treats the
//! verifier as a black box: it must be pure, and it may fail per candidate
//! (the worker counts and skips such failures).
//!
//! ## Built-in Verifiers
//!
//! | Name | Fingerprint | Derivation |
//! |------|-------------|------------|
//! | `hash160` | 20 bytes | secret key → compressed secp256k1 public key → SHA-256 → RIPEMD-160 |
//! | `sha256` | 32 bytes | SHA-256 of the 32-byte big-endian candidate |
//!
//! `hash160` additionally accepts a Base58Check P2PKH address as the target.

use rug::integer::Order;
use rug::Integer;
use ripemd::Ripemd160;
use secp256k1::{PublicKey, Secp256k1, SecretKey, SignOnly};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{TargetError, VerifyError};
use crate::range::to_hex;

/// Verifier output, compared byte-for-byte with the target.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub Vec<u8>);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(&raw)
            .map(Fingerprint)
            .map_err(serde::de::Error::custom)
    }
}

pub trait Verifier: Send + Sync {
    /// Stable identifier, part of the run's configuration fingerprint.
    fn name(&self) -> &'static str;

    fn fingerprint_len(&self) -> usize;

    fn verify(&self, candidate: &Integer) -> Result<Fingerprint, VerifyError>;

    /// Known-answer test run once before a scan starts.
    fn self_check(&self) -> Result<(), VerifyError> {
        Ok(())
    }

    /// Parse a user-supplied target for this verifier.
    fn parse_target(&self, s: &str) -> Result<Fingerprint, TargetError> {
        parse_hex_target(self.name(), self.fingerprint_len(), s)
    }
}

/// Look up a built-in verifier by name.
pub fn by_name(name: &str) -> Option<Box<dyn Verifier>> {
    match name {
        "hash160" => Some(Box::new(Hash160Verifier::new())),
        "sha256" => Some(Box::new(Sha256Verifier)),
        _ => None,
    }
}

pub const BUILTIN_VERIFIERS: [&str; 2] = ["hash160", "sha256"];

/// Encode a candidate as 32 big-endian bytes.
pub fn candidate_bytes(candidate: &Integer) -> Result<[u8; 32], VerifyError> {
    if *candidate < 0 {
        return Err(VerifyError::MalformedCandidate {
            candidate: candidate.to_string(),
            reason: "negative".into(),
        });
    }
    let digits = candidate.to_digits::<u8>(Order::Msf);
    if digits.len() > 32 {
        return Err(VerifyError::MalformedCandidate {
            candidate: to_hex(candidate),
            reason: "wider than 256 bits".into(),
        });
    }
    let mut out = [0u8; 32];
    out[32 - digits.len()..].copy_from_slice(&digits);
    Ok(out)
}

/// Parse a hex fingerprint of exactly `expected` bytes.
pub fn parse_hex_target(
    verifier: &'static str,
    expected: usize,
    s: &str,
) -> Result<Fingerprint, TargetError> {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(TargetError::Empty);
    }
    let bytes = hex::decode(digits).map_err(|e| TargetError::Hex(e.to_string()))?;
    if bytes.len() != expected {
        return Err(TargetError::Length {
            verifier,
            expected,
            got: bytes.len(),
        });
    }
    Ok(Fingerprint(bytes))
}

// ── Hash160 ─────────────────────────────────────────────────────

/// HASH160 of the compressed secp256k1 public key for the candidate secret.
pub struct Hash160Verifier {
    secp: Secp256k1<SignOnly>,
}

/// HASH160 of the public key for secret key 1 (the generator point).
const KEY_ONE_HASH160: &str = "751e76e8199196d454941c45d1b3a323f1433bd6";

impl Hash160Verifier {
    pub fn new() -> Self {
        Hash160Verifier {
            secp: Secp256k1::signing_only(),
        }
    }
}

impl Default for Hash160Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier for Hash160Verifier {
    fn name(&self) -> &'static str {
        "hash160"
    }

    fn fingerprint_len(&self) -> usize {
        20
    }

    fn verify(&self, candidate: &Integer) -> Result<Fingerprint, VerifyError> {
        let be = candidate_bytes(candidate)?;
        // Rejects zero and values >= the curve order
        let sk = SecretKey::from_slice(&be).map_err(|e| VerifyError::MalformedCandidate {
            candidate: to_hex(candidate),
            reason: e.to_string(),
        })?;
        let pk = PublicKey::from_secret_key(&self.secp, &sk);
        Ok(Fingerprint(hash160(&pk.serialize()).to_vec()))
    }

    fn self_check(&self) -> Result<(), VerifyError> {
        let got = self.verify(&Integer::from(1u32))?;
        if got.to_hex() != KEY_ONE_HASH160 {
            return Err(VerifyError::Derivation(format!(
                "self-check failed: key 1 hashed to {}, expected {}",
                got, KEY_ONE_HASH160
            )));
        }
        Ok(())
    }

    fn parse_target(&self, s: &str) -> Result<Fingerprint, TargetError> {
        let trimmed = s.trim();
        if trimmed.starts_with('1') && trimmed.len() >= 26 {
            return decode_p2pkh(trimmed);
        }
        parse_hex_target(self.name(), self.fingerprint_len(), trimmed)
    }
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let rip = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&rip);
    out
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Decode a Base58Check P2PKH address into its HASH160.
pub fn decode_p2pkh(address: &str) -> Result<Fingerprint, TargetError> {
    let raw = bs58::decode(address)
        .into_vec()
        .map_err(|e| TargetError::Address(format!("{}: {}", address, e)))?;
    if raw.len() != 25 {
        return Err(TargetError::Address(format!(
            "{}: decoded to {} bytes, expected 25",
            address,
            raw.len()
        )));
    }
    if raw[0] != 0x00 {
        return Err(TargetError::Address(format!(
            "{}: version byte {:#04x} is not P2PKH",
            address, raw[0]
        )));
    }
    let checksum = double_sha256(&raw[..21]);
    if checksum[..4] != raw[21..] {
        return Err(TargetError::Address(format!("{}: bad checksum", address)));
    }
    Ok(Fingerprint(raw[1..21].to_vec()))
}

/// Render a 20-byte HASH160 as a P2PKH address.
pub fn p2pkh_address(h160: &Fingerprint) -> Option<String> {
    if h160.len() != 20 {
        return None;
    }
    let mut payload = Vec::with_capacity(25);
    payload.push(0x00);
    payload.extend_from_slice(h160.as_bytes());
    let checksum = double_sha256(&payload);
    payload.extend_from_slice(&checksum[..4]);
    Some(bs58::encode(payload).into_string())
}

/// Compressed-pubkey WIF for a secret key, the form wallets import.
pub fn wif_compressed(key: &Integer) -> Option<String> {
    let secret = candidate_bytes(key).ok()?;
    let mut payload = Vec::with_capacity(38);
    payload.push(0x80);
    payload.extend_from_slice(&secret);
    payload.push(0x01);
    let checksum = double_sha256(&payload);
    payload.extend_from_slice(&checksum[..4]);
    Some(bs58::encode(payload).into_string())
}

// ── SHA-256 ─────────────────────────────────────────────────────

/// SHA-256 of the 32-byte big-endian candidate.
pub struct Sha256Verifier;

impl Verifier for Sha256Verifier {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn fingerprint_len(&self) -> usize {
        32
    }

    fn verify(&self, candidate: &Integer) -> Result<Fingerprint, VerifyError> {
        let be = candidate_bytes(candidate)?;
        Ok(Fingerprint(Sha256::digest(be).to_vec()))
    }
}
