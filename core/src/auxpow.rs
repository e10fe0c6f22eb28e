//! Auxiliary Proof-of-Work Structures
//!
//! Merged mining commits a tree of auxiliary-chain block hashes into the
//! parent coinbase through a 44-byte marker:
//!
//! ```text
//! magic (4)            = fa be 6d 6d
//! aux_merkle_root (32)
//! tree_size (4, LE)
//! merkle_nonce (4, LE)
//! ```
//!
//! An `AuxPowProof` is what an auxiliary chain needs to accept the parent
//! block's work: the parent coinbase, the branch linking that coinbase to the
//! parent Merkle root, the branch linking the aux chain's hash to the
//! committed aux root, and the parent header itself.

use serde::{Deserialize, Serialize};

use crate::hash::Hash256;
use crate::header::BlockHeader;
use crate::merkle::MerkleBranch;

/// Marker magic inside the coinbase scriptsig
pub const AUX_MAGIC: [u8; 4] = [0xfa, 0xbe, 0x6d, 0x6d];

/// Serialized marker size
pub const AUX_COMMITMENT_SIZE: usize = 44;

/// The aux commitment spliced into the parent coinbase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxCommitment {
    /// Root of the slot-indexed aux Merkle tree
    pub aux_merkle_root: Hash256,

    /// Leaf count of the tree (a power of two)
    pub tree_size: u32,

    /// Nonce that fixed the slot assignment
    pub merkle_nonce: u32,
}

impl AuxCommitment {
    /// Serialize to the 44-byte coinbase marker.
    pub fn serialize(&self) -> [u8; AUX_COMMITMENT_SIZE] {
        let mut out = [0u8; AUX_COMMITMENT_SIZE];
        out[0..4].copy_from_slice(&AUX_MAGIC);
        out[4..36].copy_from_slice(self.aux_merkle_root.as_bytes());
        out[36..40].copy_from_slice(&self.tree_size.to_le_bytes());
        out[40..44].copy_from_slice(&self.merkle_nonce.to_le_bytes());
        out
    }

    /// Parse a 44-byte marker.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() != AUX_COMMITMENT_SIZE || data[0..4] != AUX_MAGIC {
            return None;
        }

        let aux_merkle_root = Hash256::from_slice(&data[4..36]).ok()?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&data[36..40]);
        let tree_size = u32::from_le_bytes(buf);
        buf.copy_from_slice(&data[40..44]);
        let merkle_nonce = u32::from_le_bytes(buf);

        Some(AuxCommitment {
            aux_merkle_root,
            tree_size,
            merkle_nonce,
        })
    }

    /// Scan a coinbase for the first marker.
    pub fn find_in_coinbase(coinbase: &[u8]) -> Option<Self> {
        coinbase
            .windows(AUX_COMMITMENT_SIZE)
            .find(|w| w[0..4] == AUX_MAGIC)
            .and_then(Self::deserialize)
    }
}

/// Proof that a parent block's coinbase commits to an aux chain's hash.
#[derive(Debug, Clone)]
pub struct AuxPowProof {
    /// Parent coinbase transaction
    pub coinbase_tx: Vec<u8>,

    /// Branch from the coinbase txid to the parent Merkle root
    pub coinbase_branch: MerkleBranch,

    /// Branch from the aux hash to the committed aux Merkle root
    pub aux_branch: MerkleBranch,

    /// Parent block header
    pub parent_header: BlockHeader,
}

impl AuxPowProof {
    /// Verify the structural links of the proof:
    /// coinbase -> parent merkle root, and aux hash -> committed aux root.
    ///
    /// Whether the parent hash satisfies the aux chain's target is the
    /// caller's comparison; this function has no notion of aux difficulty.
    pub fn verify(&self, aux_hash: &Hash256) -> bool {
        let txid = Hash256(quaxis_crypto::sha256d(&self.coinbase_tx));
        if !self
            .coinbase_branch
            .verify(&txid, &self.parent_header.merkle_root)
        {
            return false;
        }

        let commitment = match AuxCommitment::find_in_coinbase(&self.coinbase_tx) {
            Some(c) => c,
            None => return false,
        };

        self.aux_branch.verify(aux_hash, &commitment.aux_merkle_root)
    }

    /// Hash of the parent header.
    pub fn parent_hash(&self) -> Hash256 {
        self.parent_header.hash()
    }
}
