//! Consensus Rules for Quaxis
//!
//! The slice of Bitcoin consensus a solo coordinator needs: the compact
//! target codec, difficulty arithmetic, and the hash-vs-target comparison.

pub mod difficulty;

pub use difficulty::{
    bits_to_target, check_proof_of_work, difficulty, meets_target, target_to_bits, TargetError,
    DIFFICULTY_ONE_BITS,
};
