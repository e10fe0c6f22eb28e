//! Chain Tip Events
//!
//! The common currency between tip sources (shared memory, relay, pool) and
//! the template cache: the inputs needed to build the next block template,
//! plus whether the tip is speculative.

use serde::{Deserialize, Serialize};

use crate::hash::Hash256;

/// Tip state codes, as stored in the shared-memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum TipState {
    /// Nothing published yet
    Empty = 0,

    /// Announced but not yet confirmed (spy-mining path)
    Speculative = 1,

    /// Fully validated tip
    Confirmed = 2,

    /// Retracted; any derived work must be dropped
    Invalid = 3,
}

impl TipState {
    /// Decode the shared-memory state word.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(TipState::Empty),
            1 => Some(TipState::Speculative),
            2 => Some(TipState::Confirmed),
            3 => Some(TipState::Invalid),
            _ => None,
        }
    }
}

/// Which source observed a tip. Lower values are higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// File-backed shared memory from a co-located node
    SharedMemory,

    /// FIBRE-style UDP relay
    Relay,

    /// Pool protocol (JSON lines over TCP)
    Pool,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::SharedMemory => write!(f, "shm"),
            SourceKind::Relay => write!(f, "relay"),
            SourceKind::Pool => write!(f, "pool"),
        }
    }
}

/// Template inputs announced by a tip source.
///
/// `prev_hash` doubles as the dedup key: it is the hash of the observed tip
/// block that the next template will build on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipEvent {
    /// Hash of the observed tip (the new template's prev_hash)
    pub prev_hash: Hash256,

    /// Height the next block will be mined at
    pub height: u32,

    /// Compact target for the next block
    pub bits: u32,

    /// Timestamp lower bound hint from the source
    pub timestamp: u32,

    /// Subsidy plus fees for the next coinbase, in satoshis
    pub coinbase_value: i64,

    /// True when the tip has been announced but not confirmed
    pub speculative: bool,
}
