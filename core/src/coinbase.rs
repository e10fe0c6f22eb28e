//! Coinbase Transaction Builder
//!
//! The coinbase is the only transaction in the blocks this coordinator mines,
//! and it is laid out so that the first 64 bytes never change when the
//! extranonce does. That stable prefix lets the SHA-256 midstate over it be
//! computed once per template and reused for every job.
//!
//! Byte layout (no aux commitment, 6-byte tag):
//!
//! ```text
//! [0..4)    version        = 01 00 00 00
//! [4]       input count    = 01
//! [5..37)   prev txid      = 00 * 32
//! [37..41)  prev vout      = ff ff ff ff
//! [41]      scriptsig len
//! [42]      height push    = 03
//! [43..46)  height         (little-endian, 3 bytes)
//! [46..52)  tag            ("quaxis")
//! [52..64)  padding        = 00 * 12
//! [64..72)  extranonce     (little-endian, 8 bytes)
//! [72..76)  sequence       = ff ff ff ff
//! [76]      output count   = 01
//! [77..85)  value          (little-endian, 8 bytes)
//! [85]      script len     = 16
//! [86..108) scriptPubKey   = 00 14 <pubkey hash * 20>   (P2WPKH)
//! [108..112) locktime      = 00 00 00 00
//! ```
//!
//! When a merged-mining commitment is active, its 44-byte marker is spliced
//! into the scriptsig right after the tag; the marker starts before byte 64
//! and the extranonce slides past it, so the prefix stays stable.

use thiserror::Error;

use crate::auxpow::AuxCommitment;
use crate::hash::Hash256;
use quaxis_crypto::Midstate;

/// Bytes of the coinbase covered by the precomputed midstate
pub const COINBASE_MIDSTATE_BYTES: usize = 64;

/// Width of the extranonce slice
pub const EXTRANONCE_SIZE: usize = 8;

/// Longest accepted scriptsig tag; keeps the aux marker start before byte 64
pub const MAX_TAG_LEN: usize = 16;

const SCRIPT_SIG_OFFSET: usize = 42;
const HEIGHT_PUSH_LEN: usize = 4;

/// Coinbase construction errors
#[derive(Debug, Error)]
pub enum CoinbaseError {
    /// Tag would push the extranonce boundary past the stable prefix
    #[error("Coinbase tag is {0} bytes, maximum is {MAX_TAG_LEN}")]
    TagTooLong(usize),

    /// Height does not fit the 3-byte push
    #[error("Block height {0} does not fit in 3 bytes")]
    HeightTooLarge(u32),
}

/// A built coinbase transaction plus the location of its extranonce slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coinbase {
    /// Full serialized transaction
    pub bytes: Vec<u8>,

    /// Offset of the 8-byte extranonce slice (always >= 64)
    pub extranonce_offset: usize,
}

impl Coinbase {
    /// SHA-256d of the full transaction.
    pub fn txid(&self) -> Hash256 {
        Hash256(quaxis_crypto::sha256d(&self.bytes))
    }

    /// Midstate over the extranonce-invariant first 64 bytes.
    pub fn midstate(&self) -> Midstate {
        let mut head = [0u8; COINBASE_MIDSTATE_BYTES];
        head.copy_from_slice(&self.bytes[..COINBASE_MIDSTATE_BYTES]);
        Midstate::from_block(&head)
    }

    /// Overwrite the extranonce slice in place. The first 64 bytes are
    /// untouched, so any cached midstate stays valid.
    pub fn patch_extranonce(&mut self, extranonce: u64) {
        let slice = &mut self.bytes[self.extranonce_offset..self.extranonce_offset + EXTRANONCE_SIZE];
        slice.copy_from_slice(&extranonce.to_le_bytes());
    }

    /// Read the current extranonce value back out.
    pub fn extranonce(&self) -> u64 {
        let mut buf = [0u8; EXTRANONCE_SIZE];
        buf.copy_from_slice(&self.bytes[self.extranonce_offset..self.extranonce_offset + EXTRANONCE_SIZE]);
        u64::from_le_bytes(buf)
    }
}

/// Builds coinbase transactions paying a fixed P2WPKH identity.
#[derive(Debug, Clone)]
pub struct CoinbaseBuilder {
    pubkey_hash: [u8; 20],
    tag: Vec<u8>,
}

impl CoinbaseBuilder {
    /// Create a builder for the given payout identity and scriptsig tag.
    pub fn new(pubkey_hash: [u8; 20], tag: &[u8]) -> Result<Self, CoinbaseError> {
        if tag.len() > MAX_TAG_LEN {
            return Err(CoinbaseError::TagTooLong(tag.len()));
        }
        Ok(CoinbaseBuilder {
            pubkey_hash,
            tag: tag.to_vec(),
        })
    }

    /// Build a coinbase for `height` paying `value` satoshis, with the given
    /// extranonce and optional merged-mining commitment.
    pub fn build(
        &self,
        height: u32,
        value: i64,
        extranonce: u64,
        aux: Option<&AuxCommitment>,
    ) -> Result<Coinbase, CoinbaseError> {
        if height > 0x00ff_ffff {
            return Err(CoinbaseError::HeightTooLarge(height));
        }

        let aux_len = if aux.is_some() { crate::auxpow::AUX_COMMITMENT_SIZE } else { 0 };
        let fixed_script_end = SCRIPT_SIG_OFFSET + HEIGHT_PUSH_LEN + self.tag.len() + aux_len;
        let extranonce_offset = fixed_script_end.max(COINBASE_MIDSTATE_BYTES);
        let script_sig_len = extranonce_offset + EXTRANONCE_SIZE - SCRIPT_SIG_OFFSET;

        let mut bytes = Vec::with_capacity(extranonce_offset + EXTRANONCE_SIZE + 40);

        // Input side
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(0x01);
        bytes.extend_from_slice(&[0u8; 32]);
        bytes.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        bytes.push(script_sig_len as u8);

        // Scriptsig: height push, tag, optional aux marker, padding, extranonce
        bytes.push(0x03);
        bytes.extend_from_slice(&height.to_le_bytes()[..3]);
        bytes.extend_from_slice(&self.tag);
        if let Some(commitment) = aux {
            bytes.extend_from_slice(&commitment.serialize());
        }
        bytes.resize(extranonce_offset, 0x00);
        bytes.extend_from_slice(&extranonce.to_le_bytes());

        // Sequence and output side
        bytes.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        bytes.push(0x01);
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes.push(0x16);
        bytes.push(0x00);
        bytes.push(0x14);
        bytes.extend_from_slice(&self.pubkey_hash);
        bytes.extend_from_slice(&0u32.to_le_bytes());

        Ok(Coinbase {
            bytes,
            extranonce_offset,
        })
    }
}
