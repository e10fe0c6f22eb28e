//! Template Cache with Speculative Pre-Computation
//!
//! Holds the template being mined (`current`), a speculative template built
//! from an unconfirmed tip (`precomputed`), and a short ring of recent tip
//! hashes for orphan detection.
//!
//! Spy mining: a speculative tip (early FIBRE header, shared-memory state 1)
//! fills the precomputed slot. When a confirmed tip for the same prev hash
//! arrives, the precomputed template is promoted in one swap instead of being
//! rebuilt. A confirmed tip that contradicts the speculative one discards it
//! silently.
//!
//! Every change of `current` bumps the template id; jobs carry the id they
//! were minted from, so invalidation is a comparison, not a traversal.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use quaxis_consensus::{bits_to_target, TargetError};
use quaxis_core::{
    AuxCommitment, BlockHeader, BlockTemplate, CoinbaseBuilder, CoinbaseError, Hash256,
    MtpCalculator, TipEvent,
};

/// How many recent tip hashes the orphan-detection ring keeps
const ANCESTOR_RING_SIZE: usize = 16;

/// Block version used for new templates (BIP9 base)
pub const TEMPLATE_VERSION: u32 = 0x2000_0000;

/// Template construction errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Bad compact target in the tip announcement
    #[error(transparent)]
    Target(#[from] TargetError),

    /// Coinbase could not be built
    #[error(transparent)]
    Coinbase(#[from] CoinbaseError),

    /// No tip observed yet
    #[error("No current template")]
    NoTemplate,
}

/// Identifier of one generation of `current`. Jobs minted from a template
/// become stale the moment the cache moves to a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId(pub u64);

/// What `on_tip` did with an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipOutcome {
    /// A speculative template was built into the precomputed slot
    Speculative,

    /// The precomputed template matched and was promoted to current
    Promoted,

    /// A fresh template was built and made current
    Built,

    /// The tip matched the template already being mined
    Unchanged,
}

struct CacheState {
    current: Option<(TemplateId, Arc<BlockTemplate>)>,
    precomputed: Option<Arc<BlockTemplate>>,
    ancestors: VecDeque<Hash256>,
    next_id: u64,
    mtp: MtpCalculator,
}

/// The cache itself; one per coordinator.
pub struct TemplateCache {
    coinbase_builder: CoinbaseBuilder,
    state: Mutex<CacheState>,
}

impl TemplateCache {
    /// Create an empty cache building coinbases with the given builder.
    pub fn new(coinbase_builder: CoinbaseBuilder) -> Self {
        TemplateCache {
            coinbase_builder,
            state: Mutex::new(CacheState {
                current: None,
                precomputed: None,
                ancestors: VecDeque::with_capacity(ANCESTOR_RING_SIZE),
                next_id: 1,
                mtp: MtpCalculator::new(),
            }),
        }
    }

    /// Feed one observed tip. Returns what changed, so the caller knows
    /// whether to re-broadcast jobs.
    pub fn on_tip(
        &self,
        tip: &TipEvent,
        aux: Option<&AuxCommitment>,
    ) -> Result<TipOutcome, TemplateError> {
        let now = unix_now();
        let mut state = self.state.lock().unwrap();

        if tip.speculative {
            // Spy mining: build into the precomputed slot without touching
            // the template being mined.
            let template = self.build_locked(&state, tip, aux, now, true)?;
            debug!(
                "speculative template ready at height {} on {}",
                tip.height, tip.prev_hash
            );
            state.precomputed = Some(Arc::new(template));
            return Ok(TipOutcome::Speculative);
        }

        if let Some((_, ref current)) = state.current {
            if current.extends(&tip.prev_hash) && !current.is_speculative {
                return Ok(TipOutcome::Unchanged);
            }
        }

        // Retire the old tip into the orphan-detection ring.
        let old_prev = state.current.as_ref().map(|(_, t)| t.prev_hash);
        if let Some(prev) = old_prev {
            if state.ancestors.len() == ANCESTOR_RING_SIZE {
                state.ancestors.pop_front();
            }
            state.ancestors.push_back(prev);
        }

        let promoted = match state.precomputed.take() {
            Some(spec) if spec.extends(&tip.prev_hash) => Some(spec),
            Some(spec) => {
                // The speculative tip lost: a different block extends the
                // chain. Discard without emitting anything.
                warn!(
                    "discarding orphaned speculative template at height {} on {}",
                    spec.height, spec.prev_hash
                );
                None
            }
            None => None,
        };

        let id = TemplateId(state.next_id);
        state.next_id += 1;

        // Only tips accepted as confirmed blocks enter the MTP window;
        // speculative announcements and duplicates are not blocks. The
        // parent's timestamp belongs in its child's window, so it is pushed
        // before the build and rolled back if the tip is rejected.
        let mtp_before = state.mtp.clone();
        state.mtp.push(tip.timestamp);

        if let Some(spec) = promoted {
            // Promote in place; the coinbase, midstates and target carry over.
            let mut template = (*spec).clone();
            template.is_speculative = false;
            info!(
                "promoted speculative template to current: height {} id {}",
                template.height, id.0
            );
            state.current = Some((id, Arc::new(template)));
            return Ok(TipOutcome::Promoted);
        }

        let template = match self.build_locked(&state, tip, aux, now, false) {
            Ok(template) => template,
            Err(e) => {
                state.mtp = mtp_before;
                return Err(e);
            }
        };
        info!(
            "new template: height {} prev {} bits {:#010x} id {}",
            tip.height, tip.prev_hash, tip.bits, id.0
        );
        state.current = Some((id, Arc::new(template)));
        Ok(TipOutcome::Built)
    }

    /// Pre-build a template for the next height against an estimated prev
    /// hash (typically a block this coordinator just found itself).
    pub fn precompute_next(
        &self,
        estimated_prev: Hash256,
        aux: Option<&AuxCommitment>,
    ) -> Result<(), TemplateError> {
        let now = unix_now();
        let mut state = self.state.lock().unwrap();

        let (_, current) = state.current.as_ref().ok_or(TemplateError::NoTemplate)?;
        let tip = TipEvent {
            prev_hash: estimated_prev,
            height: current.height + 1,
            bits: current.bits,
            timestamp: current.timestamp,
            coinbase_value: current.coinbase_value,
            speculative: true,
        };

        let template = self.build_locked(&state, &tip, aux, now, true)?;
        state.precomputed = Some(Arc::new(template));
        Ok(())
    }

    /// The template currently being mined, with its id.
    pub fn current(&self) -> Option<(TemplateId, Arc<BlockTemplate>)> {
        self.state.lock().unwrap().current.clone()
    }

    /// Id of the current template; jobs from any other id are stale.
    pub fn current_id(&self) -> Option<TemplateId> {
        self.state.lock().unwrap().current.as_ref().map(|(id, _)| *id)
    }

    /// True if the hash is a recently retired tip (orphan detection).
    pub fn is_recent_ancestor(&self, hash: &Hash256) -> bool {
        self.state.lock().unwrap().ancestors.contains(hash)
    }

    /// Drop everything, including the speculative slot.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.current = None;
        state.precomputed = None;
        state.ancestors.clear();
    }

    fn build_locked(
        &self,
        state: &CacheState,
        tip: &TipEvent,
        aux: Option<&AuxCommitment>,
        now: u32,
        speculative: bool,
    ) -> Result<BlockTemplate, TemplateError> {
        let target = bits_to_target(tip.bits)?;

        let coinbase = self
            .coinbase_builder
            .build(tip.height, tip.coinbase_value, 0, aux)?;
        let coinbase_midstate = coinbase.midstate();
        let txid = coinbase.txid();

        // A list of one: the general Merkle path, kept so non-empty blocks
        // would not change this code.
        let merkle_root = quaxis_core::compute_merkle_root(vec![txid]);

        let timestamp = now
            .max(tip.timestamp)
            .max(state.mtp.lower_bound(now));

        let header = BlockHeader {
            version: TEMPLATE_VERSION,
            prev_hash: tip.prev_hash,
            merkle_root,
            timestamp,
            bits: tip.bits,
            nonce: 0,
        };

        Ok(BlockTemplate {
            height: tip.height,
            prev_hash: tip.prev_hash,
            bits: tip.bits,
            timestamp,
            coinbase_value: tip.coinbase_value,
            coinbase_midstate,
            header_midstate: header.midstate(),
            header,
            coinbase,
            target,
            aux_commitment: aux.copied(),
            is_speculative: speculative,
        })
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TemplateCache {
        TemplateCache::new(CoinbaseBuilder::new([0x11; 20], b"quaxis").unwrap())
    }

    fn tip(prev: u8, height: u32, speculative: bool) -> TipEvent {
        TipEvent {
            prev_hash: Hash256([prev; 32]),
            height,
            bits: 0x1f00_ffff,
            timestamp: 1_700_000_000,
            coinbase_value: 625_000_000,
            speculative,
        }
    }

    #[test]
    fn test_confirmed_tip_builds_current() {
        let cache = cache();
        let outcome = cache.on_tip(&tip(0xaa, 100, false), None).unwrap();
        assert_eq!(outcome, TipOutcome::Built);

        let (id, template) = cache.current().unwrap();
        assert_eq!(template.height, 100);
        assert_eq!(template.prev_hash, Hash256([0xaa; 32]));
        assert!(!template.is_speculative);
        assert_eq!(cache.current_id(), Some(id));
    }

    #[test]
    fn test_duplicate_confirmed_tip_is_unchanged() {
        let cache = cache();
        cache.on_tip(&tip(0xaa, 100, false), None).unwrap();
        let id = cache.current_id();
        assert_eq!(
            cache.on_tip(&tip(0xaa, 100, false), None).unwrap(),
            TipOutcome::Unchanged
        );
        assert_eq!(cache.current_id(), id);
    }

    #[test]
    fn test_speculative_then_confirmation_promotes() {
        let cache = cache();
        cache.on_tip(&tip(0xaa, 100, false), None).unwrap();
        let first_id = cache.current_id().unwrap();

        assert_eq!(
            cache.on_tip(&tip(0xbb, 101, true), None).unwrap(),
            TipOutcome::Speculative
        );
        // Speculative build must not disturb the mined template.
        assert_eq!(cache.current_id(), Some(first_id));

        assert_eq!(
            cache.on_tip(&tip(0xbb, 101, false), None).unwrap(),
            TipOutcome::Promoted
        );
        let (id, template) = cache.current().unwrap();
        assert_ne!(id, first_id);
        assert_eq!(template.height, 101);
        assert!(!template.is_speculative);
    }

    #[test]
    fn test_orphaned_speculative_is_discarded() {
        let cache = cache();
        cache.on_tip(&tip(0xaa, 100, false), None).unwrap();
        cache.on_tip(&tip(0xbb, 101, true), None).unwrap();

        // A different block wins height 101: the speculative template must
        // be dropped, not promoted.
        assert_eq!(
            cache.on_tip(&tip(0xcc, 101, false), None).unwrap(),
            TipOutcome::Built
        );
        let (_, template) = cache.current().unwrap();
        assert_eq!(template.prev_hash, Hash256([0xcc; 32]));
    }

    #[test]
    fn test_new_tip_invalidates_old_id_and_records_ancestor() {
        let cache = cache();
        cache.on_tip(&tip(0xaa, 100, false), None).unwrap();
        let old_id = cache.current_id().unwrap();

        cache.on_tip(&tip(0xbb, 101, false), None).unwrap();
        assert_ne!(cache.current_id().unwrap(), old_id);
        assert!(cache.is_recent_ancestor(&Hash256([0xaa; 32])));
    }

    #[test]
    fn test_precompute_next_fills_slot() {
        let cache = cache();
        cache.on_tip(&tip(0xaa, 100, false), None).unwrap();
        cache.precompute_next(Hash256([0xdd; 32]), None).unwrap();

        // Confirmation of the estimated prev promotes the precomputed slot.
        assert_eq!(
            cache.on_tip(&tip(0xdd, 101, false), None).unwrap(),
            TipOutcome::Promoted
        );
    }

    #[test]
    fn test_template_timestamp_respects_lower_bound() {
        let cache = cache();
        let far_future = tip(0xaa, 100, false);
        let mut far_future = far_future;
        far_future.timestamp = u32::MAX - 10;
        cache.on_tip(&far_future, None).unwrap();

        let (_, template) = cache.current().unwrap();
        assert!(template.timestamp >= far_future.timestamp);
    }

    #[test]
    fn test_malformed_bits_rejected() {
        let cache = cache();
        let mut bad = tip(0xaa, 100, false);
        bad.bits = 0x1d80_0000;
        assert!(matches!(
            cache.on_tip(&bad, None),
            Err(TemplateError::Target(_))
        ));
    }
}
