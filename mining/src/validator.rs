//! Share Validation
//!
//! Every nonce an ASIC returns goes through the same funnel: job lookup,
//! staleness check, duplicate detection, then a rehash of the header's final
//! block against the precomputed midstate. A hash at or under the job target
//! is a block; everything else is counted and dropped.
//!
//! Duplicate detection inserts `(job_id, nonce)` under the same lock that
//! checks it, so two threads validating the same pair concurrently produce
//! exactly one non-duplicate outcome.

use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quaxis_consensus::{difficulty, meets_target, target_to_bits};
use quaxis_core::{BlockHeader, Hash256};

use crate::job::{JobManager, Share};

/// Version-rolling mask: bits 13-28 may be rolled by the device
pub const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

/// Bound on the duplicate-detection set
const MAX_SEEN_SHARES: usize = 100_000;

/// Classification of a validated share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// Hash meets the block target; a block was found
    BlockFound,

    /// Above the block target but meets the partial-difficulty threshold
    ValidPartial,

    /// Correctly computed, hash above target
    TargetNotMet,

    /// The job exists but its template is gone or it aged out
    StaleJob,

    /// `(job_id, nonce)` was already seen
    DuplicateShare,

    /// No record of this job id
    InvalidJobId,

    /// Rolled version touches bits outside the rolling mask
    InvalidVersion,
}

/// Result of validating one share.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Classification
    pub outcome: ShareOutcome,

    /// Candidate hash, when the share got far enough to be hashed
    pub hash: Option<Hash256>,

    /// Echo of the share's job id
    pub job_id: u32,

    /// Echo of the share's nonce
    pub nonce: u32,
}

/// A fully reconstructed winning block, ready for dispatch.
#[derive(Debug, Clone)]
pub struct FoundBlock {
    /// Header with the winning nonce (and rolled version) substituted
    pub header: BlockHeader,

    /// Exact coinbase bytes the header's Merkle root commits to
    pub coinbase: Vec<u8>,

    /// The winning hash
    pub hash: Hash256,

    /// Height of the block
    pub height: u32,
}

/// Callback invoked with each found block.
pub type FoundBlockCallback = Box<dyn Fn(&FoundBlock) + Send + Sync>;

/// Validator counters, exported for the telemetry surface.
#[derive(Debug, Default)]
pub struct ValidatorStats {
    total: AtomicU64,
    blocks_found: AtomicU64,
    partial: AtomicU64,
    target_not_met: AtomicU64,
    stale: AtomicU64,
    duplicates: AtomicU64,
    unknown_job: AtomicU64,
    bad_version: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidatorStatsSnapshot {
    pub total: u64,
    pub blocks_found: u64,
    pub partial: u64,
    pub target_not_met: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub unknown_job: u64,
    pub bad_version: u64,
}

impl ValidatorStats {
    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> ValidatorStatsSnapshot {
        ValidatorStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            target_not_met: self.target_not_met.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unknown_job: self.unknown_job.load(Ordering::Relaxed),
            bad_version: self.bad_version.load(Ordering::Relaxed),
        }
    }
}

/// The share validator.
pub struct ShareValidator {
    jobs: Arc<JobManager>,
    seen: Mutex<BTreeSet<u64>>,
    partial_difficulty: f64,
    version_mask: u32,
    callback: Mutex<Option<FoundBlockCallback>>,
    stats: ValidatorStats,
}

impl ShareValidator {
    /// Create a validator over the job registry.
    ///
    /// `partial_difficulty` of zero disables the `ValidPartial`
    /// classification entirely.
    pub fn new(jobs: Arc<JobManager>, partial_difficulty: f64) -> Self {
        ShareValidator {
            jobs,
            seen: Mutex::new(BTreeSet::new()),
            partial_difficulty,
            version_mask: VERSION_ROLLING_MASK,
            callback: Mutex::new(None),
            stats: ValidatorStats::default(),
        }
    }

    /// Install the found-block callback.
    pub fn set_found_block_callback(&self, callback: FoundBlockCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Validate one share. Idempotent: a second call with the same
    /// `(job_id, nonce)` returns `DuplicateShare`.
    pub fn validate(&self, share: &Share) -> ValidationResult {
        self.stats.bump(&self.stats.total);

        let mut result = ValidationResult {
            outcome: ShareOutcome::TargetNotMet,
            hash: None,
            job_id: share.job_id,
            nonce: share.nonce,
        };

        let snapshot = match self.jobs.snapshot(share.job_id) {
            Some(snapshot) => snapshot,
            None => {
                self.stats.bump(&self.stats.unknown_job);
                result.outcome = ShareOutcome::InvalidJobId;
                return result;
            }
        };

        if snapshot.stale {
            self.stats.bump(&self.stats.stale);
            result.outcome = ShareOutcome::StaleJob;
            return result;
        }

        if self.check_duplicate(share.job_id, share.nonce) {
            self.stats.bump(&self.stats.duplicates);
            result.outcome = ShareOutcome::DuplicateShare;
            return result;
        }

        let mut header = snapshot.header;
        header.nonce = share.nonce;

        let hash = match share.version {
            Some(version) => {
                // Rolling outside the mask would change consensus-visible
                // version bits the job never offered.
                if (version ^ header.version) & !self.version_mask != 0 {
                    self.stats.bump(&self.stats.bad_version);
                    result.outcome = ShareOutcome::InvalidVersion;
                    return result;
                }
                // A rolled version changes the first 64 header bytes, so the
                // cached midstate does not apply; hash the header outright.
                header.version = version;
                header.hash()
            }
            None => {
                let mut tail = [0u8; 16];
                tail[..12].copy_from_slice(&snapshot.header.job_tail());
                tail[12..].copy_from_slice(&share.nonce.to_le_bytes());
                let digest = snapshot
                    .midstate
                    .finish_double(&tail, quaxis_core::HEADER_SIZE)
                    .expect("16-byte tail of an 80-byte header is always a valid final block");
                Hash256(digest)
            }
        };
        result.hash = Some(hash);

        if meets_target(&hash, &snapshot.target) {
            self.stats.bump(&self.stats.blocks_found);
            result.outcome = ShareOutcome::BlockFound;
            info!(
                "block found at height {}: hash {} (job {}, nonce {:#010x})",
                snapshot.height, hash, share.job_id, share.nonce
            );

            let found = FoundBlock {
                header,
                coinbase: snapshot.coinbase,
                hash,
                height: snapshot.height,
            };
            if let Some(callback) = self.callback.lock().unwrap().as_ref() {
                callback(&found);
            } else {
                warn!("block found but no dispatcher installed");
            }
            return result;
        }

        if self.partial_difficulty > 0.0
            && difficulty(target_to_bits(&hash)) >= self.partial_difficulty
        {
            self.stats.bump(&self.stats.partial);
            result.outcome = ShareOutcome::ValidPartial;
        } else {
            self.stats.bump(&self.stats.target_not_met);
            result.outcome = ShareOutcome::TargetNotMet;
        }
        result
    }

    /// Counter surface.
    pub fn stats(&self) -> ValidatorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Forget all seen shares (used when the dedup window should reset).
    pub fn clear_seen(&self) {
        self.seen.lock().unwrap().clear();
    }

    fn check_duplicate(&self, job_id: u32, nonce: u32) -> bool {
        let key = ((job_id as u64) << 32) | nonce as u64;
        let mut seen = self.seen.lock().unwrap();

        if seen.len() >= MAX_SEEN_SHARES {
            // Evict the lowest tenth: lowest job ids are the oldest jobs.
            let cutoff = seen
                .iter()
                .nth(MAX_SEEN_SHARES / 10)
                .copied()
                .unwrap_or(u64::MAX);
            let keep = seen.split_off(&cutoff);
            *seen = keep;
        }

        !seen.insert(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extranonce::ExtranonceAllocator;
    use crate::template_cache::TemplateCache;
    use quaxis_core::{CoinbaseBuilder, TipEvent};
    use std::time::Duration;

    fn setup(bits: u32) -> (Arc<TemplateCache>, Arc<JobManager>, ShareValidator) {
        let cache = Arc::new(TemplateCache::new(
            CoinbaseBuilder::new([0x33; 20], b"quaxis").unwrap(),
        ));
        cache
            .on_tip(
                &TipEvent {
                    prev_hash: Hash256([0xaa; 32]),
                    height: 100,
                    bits,
                    timestamp: 1_700_000_000,
                    coinbase_value: 625_000_000,
                    speculative: false,
                },
                None,
            )
            .unwrap();

        let jobs = Arc::new(JobManager::new(
            cache.clone(),
            Arc::new(ExtranonceAllocator::new(1)),
            Duration::from_secs(60),
        ));
        let validator = ShareValidator::new(jobs.clone(), 0.0);
        (cache, jobs, validator)
    }

    /// Scan nonces until one meets the job's target.
    fn winning_nonce(jobs: &JobManager, job_id: u32) -> u32 {
        let snapshot = jobs.snapshot(job_id).unwrap();
        for nonce in 0..2_000_000u32 {
            let mut header = snapshot.header;
            header.nonce = nonce;
            if meets_target(&header.hash(), &snapshot.target) {
                return nonce;
            }
        }
        panic!("no winning nonce in range");
    }

    #[test]
    fn test_invalid_job_id() {
        let (_c, _j, validator) = setup(0x1f00_ffff);
        let result = validator.validate(&Share {
            job_id: 999,
            nonce: 1,
            version: None,
        });
        assert_eq!(result.outcome, ShareOutcome::InvalidJobId);
        assert_eq!(validator.stats().unknown_job, 1);
    }

    #[test]
    fn test_target_not_met_with_hard_target() {
        // A 3-byte target: no share will ever meet it.
        let (_c, jobs, validator) = setup(0x0300_0001);
        let job = jobs.mint_for_connection(1).unwrap();

        let result = validator.validate(&Share {
            job_id: job.job_id,
            nonce: 0x1234,
            version: None,
        });
        assert_eq!(result.outcome, ShareOutcome::TargetNotMet);
        assert!(result.hash.is_some());
    }

    #[test]
    fn test_duplicate_share_detected() {
        let (_c, jobs, validator) = setup(0x0300_0001);
        let job = jobs.mint_for_connection(1).unwrap();
        let share = Share {
            job_id: job.job_id,
            nonce: 0x1234,
            version: None,
        };

        assert_eq!(validator.validate(&share).outcome, ShareOutcome::TargetNotMet);
        assert_eq!(validator.validate(&share).outcome, ShareOutcome::DuplicateShare);
        assert_eq!(validator.stats().duplicates, 1);
    }

    #[test]
    fn test_stale_job_after_new_tip() {
        let (cache, jobs, validator) = setup(0x1f00_ffff);
        let job = jobs.mint_for_connection(1).unwrap();

        cache
            .on_tip(
                &TipEvent {
                    prev_hash: Hash256([0xbb; 32]),
                    height: 101,
                    bits: 0x1f00_ffff,
                    timestamp: 1_700_000_600,
                    coinbase_value: 625_000_000,
                    speculative: false,
                },
                None,
            )
            .unwrap();

        let result = validator.validate(&Share {
            job_id: job.job_id,
            nonce: 7,
            version: None,
        });
        assert_eq!(result.outcome, ShareOutcome::StaleJob);
        assert_eq!(validator.stats().stale, 1);
    }

    #[test]
    fn test_block_found_dispatches_reconstructed_block() {
        // Easy target: the top half of the hash space wins.
        let (_c, jobs, validator) = setup(0x207f_ffff);
        let job = jobs.mint_for_connection(1).unwrap();
        let nonce = winning_nonce(&jobs, job.job_id);

        let dispatched: Arc<Mutex<Vec<FoundBlock>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = dispatched.clone();
        validator.set_found_block_callback(Box::new(move |block| {
            sink.lock().unwrap().push(block.clone());
        }));

        let result = validator.validate(&Share {
            job_id: job.job_id,
            nonce,
            version: None,
        });
        assert_eq!(result.outcome, ShareOutcome::BlockFound);

        let blocks = dispatched.lock().unwrap();
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.height, 100);
        assert_eq!(block.header.nonce, nonce);
        // The dispatched header hashes to the winning hash.
        assert_eq!(block.header.hash(), block.hash);
        // And its Merkle root commits to the dispatched coinbase.
        let txid = Hash256(quaxis_crypto::sha256d(&block.coinbase));
        assert_eq!(block.header.merkle_root, txid);
    }

    #[test]
    fn test_midstate_path_matches_full_hash() {
        let (_c, jobs, validator) = setup(0x0300_0001);
        let job = jobs.mint_for_connection(1).unwrap();
        let snapshot = jobs.snapshot(job.job_id).unwrap();

        let nonce = 0xdead_beef;
        let result = validator.validate(&Share {
            job_id: job.job_id,
            nonce,
            version: None,
        });

        let mut header = snapshot.header;
        header.nonce = nonce;
        assert_eq!(result.hash, Some(header.hash()));
    }

    #[test]
    fn test_version_rolling_within_mask() {
        let (_c, jobs, validator) = setup(0x0300_0001);
        let job = jobs.mint_for_connection(1).unwrap();
        let snapshot = jobs.snapshot(job.job_id).unwrap();

        let rolled = snapshot.header.version | (0x1234 << 13);
        let result = validator.validate(&Share {
            job_id: job.job_id,
            nonce: 5,
            version: Some(rolled),
        });

        let mut header = snapshot.header;
        header.version = rolled;
        header.nonce = 5;
        assert_eq!(result.outcome, ShareOutcome::TargetNotMet);
        assert_eq!(result.hash, Some(header.hash()));
    }

    #[test]
    fn test_version_rolling_outside_mask_rejected() {
        let (_c, jobs, validator) = setup(0x0300_0001);
        let job = jobs.mint_for_connection(1).unwrap();
        let snapshot = jobs.snapshot(job.job_id).unwrap();

        let result = validator.validate(&Share {
            job_id: job.job_id,
            nonce: 5,
            version: Some(snapshot.header.version ^ 0x0000_0001),
        });
        assert_eq!(result.outcome, ShareOutcome::InvalidVersion);
        assert!(result.hash.is_none());
    }

    #[test]
    fn test_partial_difficulty_classification() {
        let cache = Arc::new(TemplateCache::new(
            CoinbaseBuilder::new([0x33; 20], b"quaxis").unwrap(),
        ));
        cache
            .on_tip(
                &TipEvent {
                    prev_hash: Hash256([0xaa; 32]),
                    height: 100,
                    bits: 0x0300_0001,
                    timestamp: 1_700_000_000,
                    coinbase_value: 625_000_000,
                    speculative: false,
                },
                None,
            )
            .unwrap();
        let jobs = Arc::new(JobManager::new(
            cache,
            Arc::new(ExtranonceAllocator::new(1)),
            Duration::from_secs(60),
        ));
        // Absurdly low partial threshold: every computed hash qualifies.
        let validator = ShareValidator::new(jobs.clone(), 1e-30);

        let job = jobs.mint_for_connection(1).unwrap();
        let result = validator.validate(&Share {
            job_id: job.job_id,
            nonce: 1,
            version: None,
        });
        assert_eq!(result.outcome, ShareOutcome::ValidPartial);
    }
}
