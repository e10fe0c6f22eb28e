//! Block Header Codec
//!
//! The 80-byte little-endian header layout:
//! version(4) || prev_hash(32) || merkle_root(32) || timestamp(4) ||
//! bits(4) || nonce(4).
//!
//! The first 64 bytes end 28 bytes into the merkle root, which is what makes
//! the midstate split useful: an ASIC only re-hashes the 16-byte tail
//! (merkle_root[28..32] || timestamp || bits || nonce) per nonce attempt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::Hash256;
use quaxis_crypto::Midstate;

/// Serialized header size
pub const HEADER_SIZE: usize = 80;

/// Bytes of the header covered by the midstate
pub const HEADER_MIDSTATE_BYTES: usize = 64;

/// Header decoding errors
#[derive(Debug, Error)]
pub enum HeaderError {
    /// Buffer is not exactly 80 bytes
    #[error("Header must be {HEADER_SIZE} bytes, got {0}")]
    Length(usize),
}

/// An 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,

    /// Hash of the previous block
    pub prev_hash: Hash256,

    /// Merkle root of the transactions
    pub merkle_root: Hash256,

    /// Block timestamp (Unix seconds)
    pub timestamp: u32,

    /// Compact target
    pub bits: u32,

    /// Proof-of-work nonce
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the canonical 80 bytes.
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parse from an 80-byte buffer.
    pub fn deserialize(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() != HEADER_SIZE {
            return Err(HeaderError::Length(data.len()));
        }

        let mut u32_at = |offset: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&data[offset..offset + 4]);
            u32::from_le_bytes(buf)
        };

        let version = u32_at(0);
        let timestamp = u32_at(68);
        let bits = u32_at(72);
        let nonce = u32_at(76);

        let mut prev = [0u8; 32];
        prev.copy_from_slice(&data[4..36]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&data[36..68]);

        Ok(BlockHeader {
            version,
            prev_hash: Hash256(prev),
            merkle_root: Hash256(merkle),
            timestamp,
            bits,
            nonce,
        })
    }

    /// SHA-256d of the serialized header.
    pub fn hash(&self) -> Hash256 {
        Hash256(quaxis_crypto::sha256d(&self.serialize()))
    }

    /// Midstate over the first 64 serialized bytes.
    pub fn midstate(&self) -> Midstate {
        let serialized = self.serialize();
        let mut head = [0u8; HEADER_MIDSTATE_BYTES];
        head.copy_from_slice(&serialized[..HEADER_MIDSTATE_BYTES]);
        Midstate::from_block(&head)
    }

    /// The 16-byte tail hashed per nonce attempt.
    pub fn tail(&self) -> [u8; 16] {
        let serialized = self.serialize();
        let mut tail = [0u8; 16];
        tail.copy_from_slice(&serialized[HEADER_MIDSTATE_BYTES..]);
        tail
    }

    /// The 12-byte job tail (the 16-byte tail minus the nonce, which the
    /// ASIC appends itself).
    pub fn job_tail(&self) -> [u8; 12] {
        let serialized = self.serialize();
        let mut tail = [0u8; 12];
        tail.copy_from_slice(&serialized[HEADER_MIDSTATE_BYTES..HEADER_SIZE - 4]);
        tail
    }
}
