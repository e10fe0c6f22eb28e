//! Core Types for Quaxis
//!
//! Hashes with chain ordering, Merkle primitives, the 80-byte header codec,
//! the stable-prefix coinbase builder, block templates, MTP tracking, and the
//! aux-PoW structures used by merged mining.

pub mod auxpow;
pub mod coinbase;
pub mod hash;
pub mod header;
pub mod merkle;
pub mod mtp;
pub mod template;
pub mod tip;

pub use auxpow::{AuxCommitment, AuxPowProof, AUX_COMMITMENT_SIZE, AUX_MAGIC};
pub use coinbase::{Coinbase, CoinbaseBuilder, CoinbaseError, EXTRANONCE_SIZE};
pub use hash::Hash256;
pub use header::{BlockHeader, HeaderError, HEADER_SIZE};
pub use merkle::{compute_merkle_root, merkle_hash, MerkleBranch, MerkleTree};
pub use mtp::{MtpCalculator, MTP_WINDOW};
pub use template::BlockTemplate;
pub use tip::{SourceKind, TipEvent, TipState};
