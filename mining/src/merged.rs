//! Merged-Mining Commitment Builder
//!
//! Auxiliary chains hand the coordinator opaque `(chain_id, block_hash,
//! target)` work. Their hashes are placed in a power-of-two Merkle tree at
//! slots derived from `(chain_id * merkle_nonce) mod tree_size`; the tree
//! root, size and nonce form the 44-byte commitment spliced into the parent
//! coinbase. One parent proof of work can then win every chain whose target
//! the candidate hash meets.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use quaxis_core::{AuxCommitment, AuxPowProof, BlockHeader, Hash256, MerkleBranch, MerkleTree};

/// How many merkle nonces to try before giving up on a slot assignment
const MAX_NONCE_SEARCH: u32 = 256;

/// Merged-mining errors
#[derive(Debug, Error)]
pub enum MergedError {
    /// No collision-free slot assignment within the search bound
    #[error("No collision-free slot assignment for {chains} chains in {tried} nonces")]
    SlotCollision { chains: usize, tried: u32 },
}

/// One auxiliary chain's current work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxChainWork {
    /// Chain identifier (fixes the Merkle slot)
    pub chain_id: u32,

    /// Aux block hash to commit to
    pub block_hash: Hash256,

    /// Target the parent hash must meet to win this chain
    pub target: Hash256,
}

/// A proof ready for one aux chain's submission channel.
#[derive(Debug, Clone)]
pub struct AuxSubmission {
    /// The chain this proof is for
    pub chain: AuxChainWork,

    /// The assembled aux-PoW proof
    pub proof: AuxPowProof,
}

/// Slot index for a chain under a given nonce and tree size.
pub fn slot_id(chain_id: u32, merkle_nonce: u32, tree_size: u32) -> u32 {
    ((chain_id as u64 * merkle_nonce as u64) % tree_size as u64) as u32
}

struct AuxTree {
    chains: Vec<AuxChainWork>,
    slots: HashMap<u32, usize>,
    tree: MerkleTree,
    commitment: AuxCommitment,
}

/// Holds the active aux work set and builds commitments from it.
pub struct MergedMiner {
    state: Mutex<Option<AuxTree>>,
}

impl Default for MergedMiner {
    fn default() -> Self {
        Self::new()
    }
}

impl MergedMiner {
    /// Create with no active aux chains.
    pub fn new() -> Self {
        MergedMiner {
            state: Mutex::new(None),
        }
    }

    /// Replace the active aux work set and rebuild the commitment.
    ///
    /// An empty set clears merged mining; the coinbase gets no marker.
    pub fn set_aux_work(
        &self,
        chains: Vec<AuxChainWork>,
    ) -> Result<Option<AuxCommitment>, MergedError> {
        if chains.is_empty() {
            *self.state.lock().unwrap() = None;
            return Ok(None);
        }

        let tree = build_aux_tree(chains)?;
        let commitment = tree.commitment;
        info!(
            "aux commitment rebuilt: {} chains, tree size {}, nonce {}",
            tree.chains.len(),
            commitment.tree_size,
            commitment.merkle_nonce
        );
        *self.state.lock().unwrap() = Some(tree);
        Ok(Some(commitment))
    }

    /// The commitment templates should currently splice in, if any.
    pub fn current_commitment(&self) -> Option<AuxCommitment> {
        self.state.lock().unwrap().as_ref().map(|t| t.commitment)
    }

    /// Number of active aux chains.
    pub fn active_chains(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.chains.len())
            .unwrap_or(0)
    }

    /// Assemble proofs for every chain the candidate hash wins.
    ///
    /// Only called with blocks whose coinbase commits to the current tree;
    /// chains whose target the hash does not meet get nothing.
    pub fn assemble_submissions(
        &self,
        parent_header: &BlockHeader,
        coinbase: &[u8],
        candidate_hash: &Hash256,
    ) -> Vec<AuxSubmission> {
        let state = self.state.lock().unwrap();
        let tree = match state.as_ref() {
            Some(tree) => tree,
            None => return Vec::new(),
        };

        // The block must actually carry this tree's commitment; a win from a
        // pre-commitment job proves nothing to the aux chains.
        match AuxCommitment::find_in_coinbase(coinbase) {
            Some(found) if found == tree.commitment => {}
            _ => return Vec::new(),
        }

        let mut submissions = Vec::new();
        for chain in &tree.chains {
            if candidate_hash > &chain.target {
                continue;
            }
            let slot = tree.slots[&chain.chain_id];
            let aux_branch = match tree.tree.branch(slot) {
                Some(branch) => branch,
                None => continue,
            };

            debug!(
                "aux win for chain {} at slot {} (hash {})",
                chain.chain_id, slot, candidate_hash
            );
            submissions.push(AuxSubmission {
                chain: *chain,
                proof: AuxPowProof {
                    coinbase_tx: coinbase.to_vec(),
                    // Empty parent block: the coinbase is the lone leaf.
                    coinbase_branch: MerkleBranch::default(),
                    aux_branch,
                    parent_header: *parent_header,
                },
            });
        }
        submissions
    }
}

fn build_aux_tree(chains: Vec<AuxChainWork>) -> Result<AuxTree, MergedError> {
    let tree_size = (chains.len() as u32).next_power_of_two();

    // Sequential scan for a nonce giving every chain a distinct slot.
    let mut chosen = None;
    for nonce in 0..MAX_NONCE_SEARCH {
        let mut slots = HashMap::with_capacity(chains.len());
        let mut collision = false;
        for chain in &chains {
            let slot = slot_id(chain.chain_id, nonce, tree_size) as usize;
            if slots.values().any(|&s| s == slot) {
                collision = true;
                break;
            }
            slots.insert(chain.chain_id, slot);
        }
        if !collision {
            chosen = Some((nonce, slots));
            break;
        }
    }

    let (merkle_nonce, slots) = chosen.ok_or(MergedError::SlotCollision {
        chains: chains.len(),
        tried: MAX_NONCE_SEARCH,
    })?;

    let mut leaves = vec![Hash256::ZERO; tree_size as usize];
    for chain in &chains {
        leaves[slots[&chain.chain_id]] = chain.block_hash;
    }

    let tree = MerkleTree::new(leaves);
    let commitment = AuxCommitment {
        aux_merkle_root: tree.root(),
        tree_size,
        merkle_nonce,
    };

    Ok(AuxTree {
        chains,
        slots,
        tree,
        commitment,
    })
}
