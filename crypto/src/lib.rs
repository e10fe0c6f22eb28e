//! SHA-256 Primitives for Quaxis
//!
//! This module wraps the `sha2` crate with the two hashing forms the
//! coordinator needs:
//! - One-shot `sha256` / `sha256d` for txids, Merkle nodes and block hashes.
//! - A midstate split (`Midstate`) that captures the compression state after
//!   the first 64-byte input block, so the share hot path only rehashes the
//!   final block of an 80-byte header.

use sha2::digest::generic_array::{typenum::U64, GenericArray};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hashing errors
#[derive(Debug, Error)]
pub enum HashError {
    /// Tail longer than a single SHA-256 block
    #[error("Midstate tail is {0} bytes, must be at most 64")]
    TailTooLong(usize),

    /// Total length inconsistent with the tail
    #[error("Total length {total} does not end in a {tail}-byte tail")]
    LengthMismatch { total: usize, tail: usize },
}

/// SHA-256 initialization vector (FIPS 180-4)
const SHA256_IV: [u32; 8] = [
    0x6a09_e667,
    0xbb67_ae85,
    0x3c6e_f372,
    0xa54f_f53a,
    0x510e_527f,
    0x9b05_688c,
    0x1f83_d9ab,
    0x5be0_cd19,
];

/// Compute SHA-256 of arbitrary data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Compute SHA-256d (double SHA-256) of arbitrary data
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// SHA-256 compression state after a whole number of 64-byte blocks.
///
/// The ASIC wire format ships the eight state words little-endian; the words
/// themselves are the raw compression state, not a finalized digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Midstate(pub [u32; 8]);

impl Midstate {
    /// Capture the state after compressing exactly one 64-byte block.
    pub fn from_block(block: &[u8; 64]) -> Self {
        let mut state = SHA256_IV;
        compress_into(&mut state, block);
        Midstate(state)
    }

    /// Capture the state after compressing a whole number of 64-byte blocks.
    ///
    /// `data` must be a multiple of 64 bytes; callers slice their prefix.
    pub fn from_blocks(data: &[u8]) -> Result<Self, HashError> {
        if data.len() % 64 != 0 {
            return Err(HashError::LengthMismatch {
                total: data.len(),
                tail: data.len() % 64,
            });
        }
        let mut state = SHA256_IV;
        for chunk in data.chunks_exact(64) {
            let mut block = [0u8; 64];
            block.copy_from_slice(chunk);
            compress_into(&mut state, &block);
        }
        Ok(Midstate(state))
    }

    /// Finish a SHA-256 computation from this state.
    ///
    /// `tail` is the remaining message after the blocks already consumed and
    /// `total_len` is the full message length in bytes. The standard
    /// Merkle-Damgard padding (0x80, zeros, 64-bit bit length) is appended.
    pub fn finish(&self, tail: &[u8], total_len: usize) -> Result<[u8; 32], HashError> {
        if tail.len() > 64 {
            return Err(HashError::TailTooLong(tail.len()));
        }
        if total_len < tail.len() || (total_len - tail.len()) % 64 != 0 {
            return Err(HashError::LengthMismatch {
                total: total_len,
                tail: tail.len(),
            });
        }

        let mut state = self.0;
        let bit_len = (total_len as u64) * 8;

        // tail + 0x80 marker + 8-byte length, padded to one or two blocks
        let padded_len = if tail.len() + 9 <= 64 { 64 } else { 128 };
        let mut padded = [0u8; 128];
        padded[..tail.len()].copy_from_slice(tail);
        padded[tail.len()] = 0x80;
        padded[padded_len - 8..padded_len].copy_from_slice(&bit_len.to_be_bytes());

        for chunk in padded[..padded_len].chunks_exact(64) {
            let mut block = [0u8; 64];
            block.copy_from_slice(chunk);
            compress_into(&mut state, &block);
        }

        let mut out = [0u8; 32];
        for (i, word) in state.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        Ok(out)
    }

    /// Finish as SHA-256d: complete the first pass from this state, then hash
    /// the 32-byte digest once more.
    pub fn finish_double(&self, tail: &[u8], total_len: usize) -> Result<[u8; 32], HashError> {
        Ok(sha256(&self.finish(tail, total_len)?))
    }

    /// Serialize the eight state words little-endian for the ASIC protocol.
    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Parse eight little-endian state words.
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut state = [0u32; 8];
        for (i, word) in state.iter_mut().enumerate() {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            *word = u32::from_le_bytes(buf);
        }
        Midstate(state)
    }
}

fn compress_into(state: &mut [u32; 8], block: &[u8; 64]) {
    let block = GenericArray::<u8, U64>::clone_from_slice(block);
    sha2::compress256(state, core::slice::from_ref(&block));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_empty() {
        // FIPS 180-4 test vector
        let digest = sha256(b"");
        assert_eq!(
            hex::encode(digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_abc() {
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256d_matches_double_application() {
        let data = b"quaxis";
        assert_eq!(sha256d(data), sha256(&sha256(data)));
    }

    #[test]
    fn test_midstate_matches_one_shot_80_bytes() {
        // An 80-byte message split as 64-byte head + 16-byte tail must hash
        // identically through the midstate path.
        let mut msg = [0u8; 80];
        for (i, byte) in msg.iter_mut().enumerate() {
            *byte = (i * 7 + 3) as u8;
        }

        let mut head = [0u8; 64];
        head.copy_from_slice(&msg[..64]);
        let midstate = Midstate::from_block(&head);

        let via_midstate = midstate.finish(&msg[64..], 80).unwrap();
        assert_eq!(via_midstate, sha256(&msg));

        let via_midstate_d = midstate.finish_double(&msg[64..], 80).unwrap();
        assert_eq!(via_midstate_d, sha256d(&msg));
    }

    #[test]
    fn test_midstate_long_tail_spills_to_second_block() {
        // A 60-byte tail forces the length field into a second padding block.
        let mut msg = [0u8; 124];
        for (i, byte) in msg.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let mut head = [0u8; 64];
        head.copy_from_slice(&msg[..64]);
        let midstate = Midstate::from_block(&head);

        assert_eq!(midstate.finish(&msg[64..], 124).unwrap(), sha256(&msg));
    }

    #[test]
    fn test_midstate_from_blocks_multiple() {
        let mut msg = [0u8; 150];
        for (i, byte) in msg.iter_mut().enumerate() {
            *byte = (i ^ 0x5a) as u8;
        }

        let midstate = Midstate::from_blocks(&msg[..128]).unwrap();
        assert_eq!(midstate.finish(&msg[128..], 150).unwrap(), sha256(&msg));
    }

    #[test]
    fn test_midstate_rejects_oversized_tail() {
        let midstate = Midstate::from_block(&[0u8; 64]);
        assert!(matches!(
            midstate.finish(&[0u8; 65], 129),
            Err(HashError::TailTooLong(65))
        ));
    }

    #[test]
    fn test_midstate_rejects_inconsistent_length() {
        let midstate = Midstate::from_block(&[0u8; 64]);
        // 70 total with a 16-byte tail leaves 54 bytes, not a block multiple.
        assert!(midstate.finish(&[0u8; 16], 70).is_err());
    }

    #[test]
    fn test_midstate_wire_round_trip() {
        let midstate = Midstate::from_block(&[0xabu8; 64]);
        let bytes = midstate.to_le_bytes();
        assert_eq!(Midstate::from_le_bytes(&bytes), midstate);
    }
}
