use std::fmt;
use std::hash::BuildHasher;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 128-bit identifier, used for checkpoint tokens and session GUIDs.
/// Rendered in the canonical 36-character dashed hexadecimal form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Guid(u128);

static GUID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl Guid {
    pub fn from_u128(value: u128) -> Self {
        Guid(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Generates a fresh identifier from wall-clock time, a process-wide
    /// sequence number, and a per-call random hasher seed.
    pub fn generate() -> Self {
        let seq = GUID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        // RandomState::new() carries fresh random seeds, so hashing the
        // counter and clock yields 128 well-mixed bits.
        let state = ahash::RandomState::new();
        let hi = state.hash_one((seq, nanos));
        let lo = state.hash_one((nanos, seq, 0x5eed_u64));
        Guid(((hi as u128) << 64) | lo as u128)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = format!("{:032x}", self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed token: expected 36-character dashed hexadecimal form")]
pub struct ParseGuidError;

impl FromStr for Guid {
    type Err = ParseGuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 36 {
            return Err(ParseGuidError);
        }
        for i in [8, 13, 18, 23] {
            if bytes[i] != b'-' {
                return Err(ParseGuidError);
            }
        }
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(ParseGuidError);
        }
        u128::from_str_radix(&hex, 16)
            .map(Guid)
            .map_err(|_| ParseGuidError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let g = Guid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        let text = g.to_string();
        assert_eq!(text, "00112233-4455-6677-8899-aabbccddeeff");
        assert_eq!(text.parse::<Guid>().unwrap(), g);
    }

    #[test]
    fn generated_tokens_are_distinct() {
        let a = Guid::generate();
        let b = Guid::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!("not-a-token".parse::<Guid>().is_err());
        assert!(
            "00112233x4455-6677-8899-aabbccddeeff"
                .parse::<Guid>()
                .is_err()
        );
    }
}
