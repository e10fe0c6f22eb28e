//! Job Minting and Tracking
//!
//! A job is the 48-byte work unit an ASIC actually receives: the header
//! midstate, the 12-byte header tail, and a job id. Minting one means
//! patching the connection's extranonce into the template coinbase,
//! re-deriving the Merkle root, and recomputing the header midstate.
//!
//! The registry keeps what validation needs later: the exact header and
//! coinbase bytes behind each job id. Records from superseded templates are
//! kept for a while so late shares classify as stale instead of unknown.

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use quaxis_core::{BlockHeader, Hash256};
use quaxis_crypto::Midstate;

use crate::extranonce::ExtranonceAllocator;
use crate::template_cache::{TemplateCache, TemplateId};

/// Job minting errors
#[derive(Debug, Error)]
pub enum JobError {
    /// No tip has been observed yet
    #[error("No current template to mint jobs from")]
    NoTemplate,
}

/// A share as reported by an ASIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Share {
    /// Job the nonce belongs to
    pub job_id: u32,

    /// Nonce found by the device
    pub nonce: u32,

    /// Rolled version, when the device uses version rolling
    pub version: Option<u32>,
}

/// The compact work unit broadcast to an ASIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Monotone job identifier
    pub job_id: u32,

    /// Header midstate after the first 64 bytes
    pub midstate: Midstate,

    /// merkle_root[28..32] || timestamp || bits
    pub header_tail: [u8; 12],

    /// Target the candidate hash must not exceed
    pub target: Hash256,
}

/// Everything validation needs to re-check a share against its job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// Full header the job was minted with (nonce zero)
    pub header: BlockHeader,

    /// Header midstate matching `header`
    pub midstate: Midstate,

    /// Exact coinbase bytes, extranonce already patched
    pub coinbase: Vec<u8>,

    /// Job target
    pub target: Hash256,

    /// Height the job mines at
    pub height: u32,

    /// True when the source template is gone or the job aged out
    pub stale: bool,
}

struct JobRecord {
    template_id: TemplateId,
    connection_id: u32,
    header: BlockHeader,
    midstate: Midstate,
    coinbase: Vec<u8>,
    target: Hash256,
    height: u32,
    issued_at: Instant,
}

struct JobState {
    next_job_id: u32,
    jobs: HashMap<u32, JobRecord>,
}

/// Mints jobs from the current template and remembers them for validation.
pub struct JobManager {
    cache: Arc<TemplateCache>,
    allocator: Arc<ExtranonceAllocator>,
    stale_ttl: Duration,
    state: Mutex<JobState>,
}

impl JobManager {
    /// Create a manager over the given cache and allocator.
    pub fn new(
        cache: Arc<TemplateCache>,
        allocator: Arc<ExtranonceAllocator>,
        stale_ttl: Duration,
    ) -> Self {
        JobManager {
            cache,
            allocator,
            stale_ttl,
            state: Mutex::new(JobState {
                next_job_id: 1,
                jobs: HashMap::new(),
            }),
        }
    }

    /// Mint a job for a connection from the current template.
    ///
    /// The connection's extranonce is allocated on first use and reused for
    /// its lifetime, so every device keeps its disjoint search space across
    /// template changes.
    pub fn mint_for_connection(&self, connection_id: u32) -> Result<Job, JobError> {
        let (template_id, template) = self.cache.current().ok_or(JobError::NoTemplate)?;
        let extranonce = self.allocator.allocate(connection_id);

        // The stable prefix means only the tail of the coinbase changes;
        // the txid and Merkle root still have to be re-derived.
        let mut coinbase = template.coinbase.clone();
        coinbase.patch_extranonce(extranonce);
        let txid = coinbase.txid();
        let merkle_root = quaxis_core::compute_merkle_root(vec![txid]);

        let mut header = template.header;
        header.merkle_root = merkle_root;
        let midstate = header.midstate();

        let mut state = self.state.lock().unwrap();
        let job_id = state.next_job_id;
        state.next_job_id = state.next_job_id.wrapping_add(1);

        state.jobs.insert(
            job_id,
            JobRecord {
                template_id,
                connection_id,
                header,
                midstate,
                coinbase: coinbase.bytes,
                target: template.target,
                height: template.height,
                issued_at: Instant::now(),
            },
        );

        debug!(
            "minted job {} for connection {} (extranonce {}, height {})",
            job_id, connection_id, extranonce, template.height
        );

        Ok(Job {
            job_id,
            midstate,
            header_tail: header.job_tail(),
            target: template.target,
        })
    }

    /// Look up a job for validation.
    pub fn snapshot(&self, job_id: u32) -> Option<JobSnapshot> {
        let state = self.state.lock().unwrap();
        let record = state.jobs.get(&job_id)?;

        let stale = self.cache.current_id() != Some(record.template_id)
            || record.issued_at.elapsed() > self.stale_ttl;

        Some(JobSnapshot {
            header: record.header,
            midstate: record.midstate,
            coinbase: record.coinbase.clone(),
            target: record.target,
            height: record.height,
            stale,
        })
    }

    /// Release a connection's extranonce and forget its jobs.
    pub fn release_connection(&self, connection_id: u32) {
        self.allocator.release(connection_id);
        let mut state = self.state.lock().unwrap();
        state.jobs.retain(|_, record| record.connection_id != connection_id);
    }

    /// Drop records older than `retention`. Called periodically; shares for
    /// pruned jobs report as unknown rather than stale.
    pub fn prune(&self, retention: Duration) {
        let mut state = self.state.lock().unwrap();
        let before = state.jobs.len();
        state.jobs.retain(|_, record| record.issued_at.elapsed() <= retention);
        let dropped = before - state.jobs.len();
        if dropped > 0 {
            debug!("pruned {dropped} expired job records");
        }
    }

    /// Number of tracked jobs.
    pub fn tracked_jobs(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    /// The allocator backing this manager.
    pub fn allocator(&self) -> &ExtranonceAllocator {
        &self.allocator
    }
}
