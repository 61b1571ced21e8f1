use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte hash type (header hashes, seed hashes, targets, PoW results)
pub type Hash256 = [u8; 32];

/// The zero hash
pub const NULL_HASH: Hash256 = [0u8; 32];

/// The easiest possible target (difficulty 1)
pub const MAX_TARGET: Hash256 = [0xFF; 32];

/// One unit of work as reported by the upstream node (`eth_getWork`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Work {
    /// Header hash the miner must find a nonce for
    pub header_hash: Hash256,
    /// Seed hash identifying the verification epoch
    pub seed_hash: Hash256,
    /// Boundary a result must not exceed to be a valid block
    pub target: Hash256,
    pub height: u64,
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Work {{ height: {}, header: {}, seed: {} }}",
            self.height,
            &hex::encode(self.header_hash)[..16],
            &hex::encode(self.seed_hash)[..16],
        )
    }
}

// ─── Hex helpers ────────────────────────────────────────────────────

/// Add a `0x` prefix unless already present.
pub fn pre_hex(hex: &str) -> String {
    if hex.starts_with("0x") {
        hex.to_string()
    } else {
        format!("0x{}", hex)
    }
}

/// Strip a leading `0x` if present.
pub fn strip_hex(hex: &str) -> &str {
    hex.strip_prefix("0x").unwrap_or(hex)
}

/// `0x`-prefixed lowercase hex of a 32-byte hash.
pub fn hash_to_hex(hash: &Hash256) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Parse a 32-byte hash, with or without `0x`.
pub fn parse_hash(s: &str) -> Option<Hash256> {
    let bytes = hex::decode(strip_hex(s)).ok()?;
    bytes.try_into().ok()
}

/// Parse an 8-byte big-endian nonce (exactly 16 hex digits, optional `0x`).
pub fn parse_nonce(s: &str) -> Option<u64> {
    let digits = strip_hex(s);
    if digits.len() != 16 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// `0x`-prefixed 16-digit hex of a nonce.
pub fn nonce_to_hex(nonce: u64) -> String {
    format!("0x{:016x}", nonce)
}

/// Parse a quantity such as `0x1e8480` or a plain decimal string.
pub fn parse_quantity(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(digits) => u64::from_str_radix(digits, 16).ok(),
        None => s.parse().ok(),
    }
}

// ─── Addresses & identifiers ────────────────────────────────────────

/// Accepts `0x` followed by 40 hex digits.
pub fn validate_address(address: &str) -> bool {
    match address.strip_prefix("0x") {
        Some(body) => body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Random lowercase hex string of `len` characters.
pub fn random_hex(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Opaque unique identifier for sessions and subscriptions.
pub fn unique_id() -> String {
    random_hex(32)
}

// ─── Difficulty & targets ───────────────────────────────────────────

/// Fixed-point scale applied to fractional difficulties before division
const DIFF_SCALE: u64 = 1_000_000;

fn two_pow_256() -> BigUint {
    BigUint::one() << 256usize
}

fn biguint_to_hash(value: &BigUint) -> Hash256 {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return MAX_TARGET;
    }
    let mut out = NULL_HASH;
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Boundary for a share difficulty: `2^256 / difficulty`, saturating at the
/// maximum target for difficulties at or below one.
pub fn difficulty_to_target(difficulty: f64) -> Hash256 {
    if !difficulty.is_finite() || difficulty <= 1.0 {
        return MAX_TARGET;
    }
    let scaled = (difficulty * DIFF_SCALE as f64).round();
    let denominator = match scaled.to_u128() {
        Some(d) if d > 0 => BigUint::from(d),
        _ => return MAX_TARGET,
    };
    let target = (two_pow_256() * BigUint::from(DIFF_SCALE)) / denominator;
    biguint_to_hash(&target)
}

/// Difficulty implied by a hash value: `2^256 / value`. Smaller values mean
/// higher difficulty; the zero hash maps to `f64::MAX`.
pub fn target_to_difficulty(value: &Hash256) -> f64 {
    let v = BigUint::from_bytes_be(value);
    if v.is_zero() {
        return f64::MAX;
    }
    let numerator = two_pow_256().to_f64().unwrap_or(f64::MAX);
    numerator / v.to_f64().unwrap_or(f64::MAX)
}

/// Big-endian comparison: does `result` satisfy `target`?
pub fn meets_target(result: &Hash256, target: &Hash256) -> bool {
    result <= target
}
