//! Block Templates
//!
//! A template is everything derived from one observed chain tip: the coinbase
//! with its precomputed midstate, the header skeleton, and the decoded
//! target. Jobs are stamped out of a template by patching the extranonce
//! slice and re-deriving the Merkle root.

use crate::auxpow::AuxCommitment;
use crate::coinbase::Coinbase;
use crate::hash::Hash256;
use crate::header::BlockHeader;
use quaxis_crypto::Midstate;

/// A block template built from one chain tip.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    /// Height this template mines at
    pub height: u32,

    /// Tip this template extends
    pub prev_hash: Hash256,

    /// Compact target
    pub bits: u32,

    /// Chosen timestamp (already clamped to max(now, lower bound, MTP+1))
    pub timestamp: u32,

    /// Coinbase payout in satoshis
    pub coinbase_value: i64,

    /// Coinbase transaction with its extranonce slice located
    pub coinbase: Coinbase,

    /// Midstate over the coinbase's stable 64-byte prefix
    pub coinbase_midstate: Midstate,

    /// Header skeleton (nonce zero, Merkle root for the base extranonce)
    pub header: BlockHeader,

    /// Midstate over the header skeleton's first 64 bytes
    pub header_midstate: Midstate,

    /// Decoded target the block hash must not exceed
    pub target: Hash256,

    /// Aux commitment spliced into the coinbase, if merged mining is active
    pub aux_commitment: Option<AuxCommitment>,

    /// True when built from an unconfirmed (spy-mining) tip
    pub is_speculative: bool,
}

impl BlockTemplate {
    /// True if this template extends the given tip.
    pub fn extends(&self, tip_hash: &Hash256) -> bool {
        self.prev_hash == *tip_hash
    }
}
