//! 256-bit Hash Type
//!
//! `Hash256` stores 32 bytes and compares as a 256-bit unsigned integer in
//! little-endian byte order: byte 0 is the least significant. Every chain
//! comparison in the coordinator (`hash <= target`) goes through this
//! ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Hash parsing errors
#[derive(Debug, Error)]
pub enum HashParseError {
    /// Not valid hex
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Wrong length after decoding
    #[error("Expected 32 bytes, got {0}")]
    Length(usize),
}

/// A 256-bit hash, numerically little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash (also the unused-leaf value in aux Merkle trees).
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }

    /// Copy from a 32-byte slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, HashParseError> {
        if slice.len() != 32 {
            return Err(HashParseError::Length(slice.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Hash256(bytes))
    }

    /// Parse from a hex string (byte order as stored).
    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let decoded = hex::decode(s)?;
        Self::from_slice(&decoded)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl Ord for Hash256 {
    fn cmp(&self, other: &Self) -> Ordering {
        // Little-endian: the most significant byte is at index 31.
        for i in (0..32).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Hash256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_ordering() {
        // Byte 31 is most significant.
        let mut high = [0u8; 32];
        high[31] = 1;
        let mut low = [0xffu8; 32];
        low[31] = 0;

        assert!(Hash256(low) < Hash256(high));
        assert!(Hash256(high) > Hash256::ZERO);
    }

    #[test]
    fn test_ordering_falls_through_to_low_bytes() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[0] = 2;
        b[0] = 3;
        assert!(Hash256(a) < Hash256(b));
        assert_eq!(Hash256(a).cmp(&Hash256(a)), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = Hash256::from_hex(
            "aa00000000000000000000000000000000000000000000000000000000000bb0",
        )
        .unwrap();
        assert_eq!(hash.0[0], 0xaa);
        assert_eq!(hash.0[31], 0xb0);
        assert_eq!(Hash256::from_hex(&hash.to_string()).unwrap(), hash);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(matches!(
            Hash256::from_slice(&[0u8; 31]),
            Err(HashParseError::Length(31))
        ));
    }
}
