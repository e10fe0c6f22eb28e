//! Merkle Tree Primitives
//!
//! Bitcoin-style Merkle hashing: nodes are SHA-256d(left || right), an odd
//! level duplicates its last node. `MerkleTree` additionally pads its leaves
//! to a power of two, which is the shape both the aux commitment tree and
//! branch extraction want: a branch always carries exactly log2(size)
//! siblings.

use crate::hash::Hash256;
use quaxis_crypto::sha256d;

/// Combine two nodes into their parent.
pub fn merkle_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left.as_bytes());
    combined[32..].copy_from_slice(right.as_bytes());
    Hash256(sha256d(&combined))
}

/// Compute a Merkle root from a list of leaves.
///
/// A single leaf is its own root (the empty-block coinbase case). An odd
/// level duplicates the last node before pairing.
pub fn compute_merkle_root(mut leaves: Vec<Hash256>) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    while leaves.len() > 1 {
        if leaves.len() % 2 != 0 {
            let last = *leaves.last().unwrap();
            leaves.push(last);
        }

        let mut next = Vec::with_capacity(leaves.len() / 2);
        for pair in leaves.chunks_exact(2) {
            next.push(merkle_hash(&pair[0], &pair[1]));
        }
        leaves = next;
    }

    leaves[0]
}

/// The siblings along a leaf's path to the root, plus the leaf index whose
/// bits encode left/right at each level.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MerkleBranch {
    /// Sibling hashes, leaf level first
    pub hashes: Vec<Hash256>,

    /// Index of the leaf this branch belongs to
    pub index: u32,
}

impl MerkleBranch {
    /// Recompute the root from a leaf by folding in the siblings.
    pub fn compute_root(&self, leaf: &Hash256) -> Hash256 {
        let mut current = *leaf;
        let mut idx = self.index;

        for sibling in &self.hashes {
            current = if idx & 1 == 1 {
                merkle_hash(sibling, &current)
            } else {
                merkle_hash(&current, sibling)
            };
            idx >>= 1;
        }

        current
    }

    /// True if the branch connects `leaf` to `expected_root`.
    pub fn verify(&self, leaf: &Hash256, expected_root: &Hash256) -> bool {
        self.compute_root(leaf) == *expected_root
    }
}

/// A fully materialized Merkle tree over power-of-two padded leaves.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<Hash256>,
    leaf_count: usize,
    padded_count: usize,
}

impl MerkleTree {
    /// Build a tree, padding the leaf level to a power of two by duplicating
    /// the last leaf.
    pub fn new(mut leaves: Vec<Hash256>) -> Self {
        let leaf_count = leaves.len();
        if leaves.is_empty() {
            return MerkleTree {
                nodes: vec![Hash256::ZERO],
                leaf_count: 0,
                padded_count: 1,
            };
        }

        while leaves.len() > 1 && !leaves.len().is_power_of_two() {
            let last = *leaves.last().unwrap();
            leaves.push(last);
        }
        let padded_count = leaves.len();

        let mut nodes = leaves;
        let mut level_start = 0;
        let mut level_size = padded_count;

        while level_size > 1 {
            for i in 0..level_size / 2 {
                let parent = merkle_hash(
                    &nodes[level_start + i * 2],
                    &nodes[level_start + i * 2 + 1],
                );
                nodes.push(parent);
            }
            level_start += level_size;
            level_size /= 2;
        }

        MerkleTree {
            nodes,
            leaf_count,
            padded_count,
        }
    }

    /// The root node.
    pub fn root(&self) -> Hash256 {
        *self.nodes.last().unwrap()
    }

    /// Number of real (unpadded) leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Extract the branch for leaf `index`.
    ///
    /// Returns `None` when the index is outside the padded leaf level.
    pub fn branch(&self, index: usize) -> Option<MerkleBranch> {
        if index >= self.padded_count {
            return None;
        }

        let mut branch = MerkleBranch {
            hashes: Vec::new(),
            index: index as u32,
        };

        let mut level_start = 0;
        let mut level_size = self.padded_count;
        let mut idx = index;

        while level_size > 1 {
            let sibling = if idx & 1 == 1 { idx - 1 } else { idx + 1 };
            branch.hashes.push(self.nodes[level_start + sibling]);

            level_start += level_size;
            level_size /= 2;
            idx /= 2;
        }

        Some(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        Hash256(bytes)
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let l = leaf(7);
        assert_eq!(compute_merkle_root(vec![l]), l);
    }

    #[test]
    fn test_two_leaf_root() {
        let (a, b) = (leaf(1), leaf(2));
        assert_eq!(compute_merkle_root(vec![a, b]), merkle_hash(&a, &b));
    }

    #[test]
    fn test_odd_count_duplicates_last() {
        let (a, b, c) = (leaf(1), leaf(2), leaf(3));
        let expected = merkle_hash(&merkle_hash(&a, &b), &merkle_hash(&c, &c));
        assert_eq!(compute_merkle_root(vec![a, b, c]), expected);
    }

    #[test]
    fn test_tree_root_matches_flat_computation() {
        let leaves: Vec<Hash256> = (0..8).map(leaf).collect();
        let tree = MerkleTree::new(leaves.clone());
        assert_eq!(tree.root(), compute_merkle_root(leaves));
    }

    #[test]
    fn test_branch_verifies_for_every_leaf() {
        for count in 1..=8usize {
            let leaves: Vec<Hash256> = (0..count as u8).map(leaf).collect();
            let tree = MerkleTree::new(leaves.clone());
            let root = tree.root();

            for (i, l) in leaves.iter().enumerate() {
                let branch = tree.branch(i).unwrap();
                assert!(
                    branch.verify(l, &root),
                    "branch failed for leaf {i} of {count}"
                );
                assert_eq!(branch.hashes.len(), tree.padded_count.trailing_zeros() as usize);
            }
        }
    }

    #[test]
    fn test_branch_rejects_wrong_root() {
        let leaves: Vec<Hash256> = (0..4).map(leaf).collect();
        let tree = MerkleTree::new(leaves.clone());
        let branch = tree.branch(2).unwrap();
        assert!(!branch.verify(&leaves[2], &Hash256::ZERO));
        assert!(!branch.verify(&leaves[1], &tree.root()));
    }

    #[test]
    fn test_branch_out_of_range() {
        let tree = MerkleTree::new(vec![leaf(1), leaf(2)]);
        assert!(tree.branch(2).is_none());
    }
}
