//! End-to-end pipeline scenarios: tips through jobs to validated shares,
//! including merged-mining fan-out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use quaxis_consensus::meets_target;
use quaxis_core::{CoinbaseBuilder, Hash256, TipEvent};
use quaxis_mining::{
    AuxChainWork, ExtranonceAllocator, FoundBlock, JobManager, MergedMiner, Share, ShareOutcome,
    ShareValidator, TemplateCache,
};

fn tip(prev: u8, height: u32, bits: u32) -> TipEvent {
    TipEvent {
        prev_hash: Hash256([prev; 32]),
        height,
        bits,
        timestamp: 1_700_000_000,
        coinbase_value: 625_000_000,
        speculative: false,
    }
}

fn pipeline(bits: u32) -> (Arc<TemplateCache>, Arc<JobManager>, ShareValidator) {
    let cache = Arc::new(TemplateCache::new(
        CoinbaseBuilder::new([0x66; 20], b"quaxis").unwrap(),
    ));
    cache.on_tip(&tip(0xaa, 100, bits), None).unwrap();
    let jobs = Arc::new(JobManager::new(
        cache.clone(),
        Arc::new(ExtranonceAllocator::new(1)),
        Duration::from_secs(60),
    ));
    let validator = ShareValidator::new(jobs.clone(), 0.0);
    (cache, jobs, validator)
}

fn winning_nonce(jobs: &JobManager, job_id: u32) -> u32 {
    let snapshot = jobs.snapshot(job_id).unwrap();
    (0..2_000_000u32)
        .find(|&nonce| {
            let mut header = snapshot.header;
            header.nonce = nonce;
            meets_target(&header.hash(), &snapshot.target)
        })
        .expect("no winning nonce in range")
}

#[test]
fn test_extranonce_uniqueness_under_churn() {
    // The same peer connects, disconnects and reconnects 100 times; every
    // life gets a distinct extranonce and the counter never rewinds.
    let (_cache, jobs, _validator) = pipeline(0x1f00_ffff);
    let mut seen = std::collections::HashSet::new();

    for cycle in 0..100u32 {
        let connection_id = 1000 + cycle;
        jobs.mint_for_connection(connection_id).unwrap();
        let extranonce = jobs.allocator().get(connection_id).unwrap();
        assert!(seen.insert(extranonce), "extranonce {extranonce} reused");
        jobs.release_connection(connection_id);
    }

    assert_eq!(seen.len(), 100);
    assert_eq!(jobs.allocator().peek_next(), 101);
}

#[test]
fn test_stale_job_not_dispatched() {
    // A share for a job from the superseded tip is stale, and no block is
    // dispatched for it even if its hash would have won.
    let (cache, jobs, validator) = pipeline(0x207f_ffff);
    let job = jobs.mint_for_connection(1).unwrap();
    let nonce = winning_nonce(&jobs, job.job_id);

    let dispatched: Arc<Mutex<Vec<FoundBlock>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = dispatched.clone();
    validator.set_found_block_callback(Box::new(move |block| {
        sink.lock().unwrap().push(block.clone());
    }));

    cache.on_tip(&tip(0xbb, 101, 0x207f_ffff), None).unwrap();

    let result = validator.validate(&Share {
        job_id: job.job_id,
        nonce,
        version: None,
    });
    assert_eq!(result.outcome, ShareOutcome::StaleJob);
    assert!(dispatched.lock().unwrap().is_empty());
    assert_eq!(validator.stats().stale, 1);
    assert_eq!(validator.stats().blocks_found, 0);
}

#[test]
fn test_duplicate_share_sequence() {
    let (_cache, jobs, validator) = pipeline(0x0300_0001);
    let job = jobs.mint_for_connection(1).unwrap();
    let share = Share {
        job_id: job.job_id,
        nonce: 0x1234,
        version: None,
    };

    let first = validator.validate(&share).outcome;
    assert!(matches!(
        first,
        ShareOutcome::TargetNotMet | ShareOutcome::BlockFound
    ));
    assert_eq!(validator.validate(&share).outcome, ShareOutcome::DuplicateShare);
}

#[test]
fn test_simple_win_counters_clean() {
    // One tip, one device, one winning share: a dispatched block and no
    // stale or duplicate counts.
    let (_cache, jobs, validator) = pipeline(0x207f_ffff);
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

    let stats = validator.stats();
    assert_eq!(stats.blocks_found, 1);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(stats.stale, 0);

    let blocks = dispatched.lock().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].height, 100);
}

#[test]
fn test_merged_mining_win_fans_out_selectively() {
    // Two aux chains: A accepts any hash, B accepts none. A parent win
    // dispatches the parent block and a proof for A only.
    let merged = MergedMiner::new();
    let chain_a = AuxChainWork {
        chain_id: 1,
        block_hash: Hash256([0xa1; 32]),
        target: Hash256([0xff; 32]),
    };
    let chain_b = AuxChainWork {
        chain_id: 2,
        block_hash: Hash256([0xb2; 32]),
        target: Hash256::ZERO,
    };
    let commitment = merged
        .set_aux_work(vec![chain_a, chain_b])
        .unwrap()
        .unwrap();

    let cache = Arc::new(TemplateCache::new(
        CoinbaseBuilder::new([0x66; 20], b"quaxis").unwrap(),
    ));
    cache
        .on_tip(&tip(0xaa, 100, 0x207f_ffff), Some(&commitment))
        .unwrap();
    let jobs = Arc::new(JobManager::new(
        cache.clone(),
        Arc::new(ExtranonceAllocator::new(1)),
        Duration::from_secs(60),
    ));
    let validator = ShareValidator::new(jobs.clone(), 0.0);

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
    let block = &blocks[0];

    let submissions = merged.assemble_submissions(&block.header, &block.coinbase, &block.hash);
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].chain.chain_id, 1);
    assert!(submissions[0].proof.verify(&chain_a.block_hash));

    // The winning coinbase really carries the commitment it proves.
    assert_eq!(
        quaxis_core::AuxCommitment::find_in_coinbase(&block.coinbase),
        Some(commitment)
    );
}

#[test]
fn test_speculative_template_never_dispatches_after_orphaning() {
    // A speculative tip is staged, then orphaned by a different block. No
    // share event fires for the discarded template.
    let (cache, jobs, validator) = pipeline(0x207f_ffff);

    let mut speculative = tip(0xbb, 101, 0x207f_ffff);
    speculative.speculative = true;
    cache.on_tip(&speculative, None).unwrap();

    // Jobs still mint against the confirmed tip at height 100.
    let job = jobs.mint_for_connection(1).unwrap();
    let snapshot = jobs.snapshot(job.job_id).unwrap();
    assert_eq!(snapshot.height, 100);

    // A competing block at 101 orphans the speculative template.
    cache.on_tip(&tip(0xcc, 101, 0x207f_ffff), None).unwrap();

    let dispatched: Arc<Mutex<Vec<FoundBlock>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = dispatched.clone();
    validator.set_found_block_callback(Box::new(move |block| {
        sink.lock().unwrap().push(block.clone());
    }));

    // The old job is stale now; even a winning nonce dispatches nothing.
    let nonce = winning_nonce(&jobs, job.job_id);
    let result = validator.validate(&Share {
        job_id: job.job_id,
        nonce,
        version: None,
    });
    assert_eq!(result.outcome, ShareOutcome::StaleJob);
    assert!(dispatched.lock().unwrap().is_empty());
}
