//! Shared-Memory Tip Region
//!
//! A file-backed region through which a co-located (modified) node announces
//! chain tips at ~100 ns latency. Single writer, many readers, coordinated
//! solely through a sequence counter:
//!
//! - the writer stores all fields, then increments `sequence` with release
//!   ordering;
//! - a reader loads `sequence` with acquire ordering, copies the fields, and
//!   re-checks `sequence`; a mismatch means a concurrent write, so it
//!   retries.
//!
//! Region layout (little-endian, 144 bytes):
//!
//! ```text
//! [0..8)     sequence        u64 (atomic)
//! [8..12)    state           u32 (0 empty, 1 speculative, 2 confirmed, 3 invalid)
//! [12..16)   height          u32
//! [16..20)   bits            u32
//! [20..24)   timestamp       u32
//! [24..32)   coinbase_value  i64
//! [32..112)  header_raw      [80]
//! [112..144) block_hash      [32]
//! ```
//!
//! A second region of the same discipline runs the other way: found blocks
//! are handed back to the node through `BlockSubmitter`.

use log::{debug, info, warn};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

use quaxis_core::{BlockHeader, Hash256, TipEvent, TipState, HEADER_SIZE};

use crate::waiter::{AdaptiveWaiter, WaiterConfig};

/// Size of the tip region
pub const TIP_REGION_SIZE: usize = 144;

/// Size of the found-block return region
pub const SUBMIT_REGION_SIZE: usize = 8 + 4 + HEADER_SIZE + MAX_SUBMIT_COINBASE;

/// Largest coinbase the return channel carries
pub const MAX_SUBMIT_COINBASE: usize = 256;

const OFF_STATE: usize = 8;
const OFF_HEIGHT: usize = 12;
const OFF_BITS: usize = 16;
const OFF_TIMESTAMP: usize = 20;
const OFF_VALUE: usize = 24;
const OFF_HEADER: usize = 32;
const OFF_HASH: usize = 112;

/// Shared-memory errors
#[derive(Debug, Error)]
pub enum ShmError {
    /// File could not be opened or mapped
    #[error("Shared memory I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mapped file smaller than the region layout
    #[error("Region file is {actual} bytes, need {needed}")]
    RegionTooSmall { actual: usize, needed: usize },

    /// Unknown state code read from the region
    #[error("Unknown tip state code {0}")]
    BadState(u32),

    /// Coinbase too large for the return channel
    #[error("Coinbase of {0} bytes exceeds the {MAX_SUBMIT_COINBASE}-byte submit slot")]
    CoinbaseTooLarge(usize),
}

/// One consistent copy of the tip region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipSnapshot {
    /// Sequence the snapshot was taken at
    pub sequence: u64,

    /// Publication state
    pub state: TipState,

    /// Height the next block mines at
    pub height: u32,

    /// Compact target for the next block
    pub bits: u32,

    /// Tip timestamp (lower bound hint)
    pub timestamp: u32,

    /// Coinbase value for the next block
    pub coinbase_value: i64,

    /// Raw 80-byte header of the observed tip
    pub header_raw: [u8; HEADER_SIZE],

    /// Hash of the observed tip (the next template's prev)
    pub block_hash: Hash256,
}

impl TipSnapshot {
    /// Parse the raw header bytes.
    pub fn header(&self) -> Result<BlockHeader, quaxis_core::HeaderError> {
        BlockHeader::deserialize(&self.header_raw)
    }

    /// Convert into the template inputs the cache consumes.
    pub fn to_tip_event(&self) -> TipEvent {
        TipEvent {
            prev_hash: self.block_hash,
            height: self.height,
            bits: self.bits,
            timestamp: self.timestamp,
            coinbase_value: self.coinbase_value,
            speculative: self.state == TipState::Speculative,
        }
    }
}

fn map_file(path: &Path, size: usize, create: bool) -> Result<MmapMut, ShmError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(path)?;
    if create {
        file.set_len(size as u64)?;
    } else {
        let actual = file.metadata()?.len() as usize;
        if actual < size {
            return Err(ShmError::RegionTooSmall {
                actual,
                needed: size,
            });
        }
    }
    // Safety: the mapping is private to this process's view of a regular
    // file; all cross-process coordination goes through the sequence word.
    Ok(unsafe { MmapMut::map_mut(&file)? })
}

fn sequence_word(mmap: &MmapMut) -> &AtomicU64 {
    // Safety: offset 0 is 8-byte aligned (page-aligned mapping) and both
    // sides access it atomically only.
    unsafe { &*(mmap.as_ptr() as *const AtomicU64) }
}

/// Writer side of the tip region. One per region file.
pub struct TipRegionWriter {
    mmap: MmapMut,
    sequence: u64,
}

impl TipRegionWriter {
    /// Create (or truncate to size) the region file and map it.
    pub fn create(path: &Path) -> Result<Self, ShmError> {
        let mmap = map_file(path, TIP_REGION_SIZE, true)?;
        Ok(TipRegionWriter { mmap, sequence: 0 })
    }

    /// Publish a tip: write every field, then bump the sequence with release
    /// ordering so readers see a complete record.
    pub fn publish(
        &mut self,
        state: TipState,
        height: u32,
        bits: u32,
        timestamp: u32,
        coinbase_value: i64,
        header_raw: &[u8; HEADER_SIZE],
        block_hash: &Hash256,
    ) {
        let base = self.mmap.as_mut_ptr();
        // Safety: offsets are within the mapped TIP_REGION_SIZE.
        unsafe {
            std::ptr::copy_nonoverlapping((state as u32).to_le_bytes().as_ptr(), base.add(OFF_STATE), 4);
            std::ptr::copy_nonoverlapping(height.to_le_bytes().as_ptr(), base.add(OFF_HEIGHT), 4);
            std::ptr::copy_nonoverlapping(bits.to_le_bytes().as_ptr(), base.add(OFF_BITS), 4);
            std::ptr::copy_nonoverlapping(timestamp.to_le_bytes().as_ptr(), base.add(OFF_TIMESTAMP), 4);
            std::ptr::copy_nonoverlapping(coinbase_value.to_le_bytes().as_ptr(), base.add(OFF_VALUE), 8);
            std::ptr::copy_nonoverlapping(header_raw.as_ptr(), base.add(OFF_HEADER), HEADER_SIZE);
            std::ptr::copy_nonoverlapping(block_hash.as_bytes().as_ptr(), base.add(OFF_HASH), 32);
        }

        self.sequence += 1;
        sequence_word(&self.mmap).store(self.sequence, Ordering::Release);
    }
}

/// Reader side of the tip region.
pub struct TipRegionReader {
    mmap: MmapMut,
    waiter: AdaptiveWaiter,
    last_sequence: u64,
}

impl TipRegionReader {
    /// Map an existing region file.
    pub fn open(path: &Path, waiter_config: WaiterConfig) -> Result<Self, ShmError> {
        let mmap = map_file(path, TIP_REGION_SIZE, false)?;
        Ok(TipRegionReader {
            mmap,
            waiter: AdaptiveWaiter::new(waiter_config),
            last_sequence: 0,
        })
    }

    /// Take a consistent snapshot if the sequence moved past `last_seen`.
    pub fn try_read(&self, last_seen: u64) -> Result<Option<TipSnapshot>, ShmError> {
        let sequence = sequence_word(&self.mmap);

        loop {
            let s1 = sequence.load(Ordering::Acquire);
            if s1 == last_seen || s1 == 0 {
                return Ok(None);
            }

            let snapshot = self.copy_fields(s1)?;

            // A concurrent write moved the sequence mid-copy: retry.
            fence(Ordering::Acquire);
            let s2 = sequence.load(Ordering::Acquire);
            if s1 == s2 {
                return Ok(Some(snapshot));
            }
        }
    }

    /// Block on the adaptive waiter until a new tip or the deadline.
    pub fn wait_for_tip(&mut self, deadline: Instant) -> Result<Option<TipSnapshot>, ShmError> {
        loop {
            if let Some(snapshot) = self.try_read(self.last_sequence)? {
                self.last_sequence = snapshot.sequence;
                return Ok(Some(snapshot));
            }

            let sequence = sequence_word(&self.mmap);
            match self
                .waiter
                .wait_for_change(sequence, self.last_sequence, Some(deadline))
            {
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Rough CPU share of the waiter's current phase.
    pub fn estimated_cpu_percent(&self) -> f64 {
        self.waiter.estimated_cpu_percent()
    }

    fn copy_fields(&self, sequence: u64) -> Result<TipSnapshot, ShmError> {
        let base = self.mmap.as_ptr();

        let mut header_raw = [0u8; HEADER_SIZE];
        let mut hash = [0u8; 32];
        let (state_word, height, bits, timestamp, coinbase_value);
        // Safety: offsets are within the mapped region. The copies are only
        // trusted after the caller re-checks the sequence word.
        unsafe {
            let mut word = [0u8; 8];
            std::ptr::copy_nonoverlapping(base.add(OFF_STATE), word.as_mut_ptr(), 4);
            state_word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            std::ptr::copy_nonoverlapping(base.add(OFF_HEIGHT), word.as_mut_ptr(), 4);
            height = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            std::ptr::copy_nonoverlapping(base.add(OFF_BITS), word.as_mut_ptr(), 4);
            bits = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            std::ptr::copy_nonoverlapping(base.add(OFF_TIMESTAMP), word.as_mut_ptr(), 4);
            timestamp = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            std::ptr::copy_nonoverlapping(base.add(OFF_VALUE), word.as_mut_ptr(), 8);
            coinbase_value = i64::from_le_bytes(word);
            std::ptr::copy_nonoverlapping(base.add(OFF_HEADER), header_raw.as_mut_ptr(), HEADER_SIZE);
            std::ptr::copy_nonoverlapping(base.add(OFF_HASH), hash.as_mut_ptr(), 32);
        }

        let state = TipState::from_u32(state_word).ok_or(ShmError::BadState(state_word))?;
        Ok(TipSnapshot {
            sequence,
            state,
            height,
            bits,
            timestamp,
            coinbase_value,
            header_raw,
            block_hash: Hash256(hash),
        })
    }
}

/// Dedicated subscriber thread: adaptive-waits on the region and forwards
/// tips into the coordinator's channel.
pub struct ShmSubscriber {
    reader: TipRegionReader,
    poll_deadline: Duration,
}

impl ShmSubscriber {
    /// Wrap a reader; `poll_deadline` bounds each wait so shutdown is seen.
    pub fn new(reader: TipRegionReader, poll_deadline: Duration) -> Self {
        ShmSubscriber {
            reader,
            poll_deadline,
        }
    }

    /// Spawn the subscriber thread. The thread exits when `shutdown` is set
    /// or the channel closes.
    pub fn spawn(
        mut self,
        tip_tx: mpsc::Sender<TipEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("shm-subscriber".to_string())
            .spawn(move || {
                info!("shared-memory subscriber running");
                while !shutdown.load(Ordering::Relaxed) {
                    let deadline = Instant::now() + self.poll_deadline;
                    match self.reader.wait_for_tip(deadline) {
                        Ok(Some(snapshot)) => {
                            match snapshot.state {
                                TipState::Empty => continue,
                                TipState::Invalid => {
                                    warn!("tip region marked invalid at seq {}", snapshot.sequence);
                                    continue;
                                }
                                TipState::Speculative | TipState::Confirmed => {}
                            }
                            debug!(
                                "shm tip: height {} prev {} (seq {})",
                                snapshot.height, snapshot.block_hash, snapshot.sequence
                            );
                            if tip_tx.blocking_send(snapshot.to_tip_event()).is_err() {
                                break;
                            }
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("tip region read failed: {e}");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
                info!("shared-memory subscriber stopped");
            })
            .expect("spawn shm-subscriber thread")
    }
}

/// Writer for the found-block return channel.
pub struct BlockSubmitter {
    mmap: MmapMut,
    sequence: u64,
}

impl BlockSubmitter {
    /// Create (or truncate) the submit region file.
    pub fn create(path: &Path) -> Result<Self, ShmError> {
        let mmap = map_file(path, SUBMIT_REGION_SIZE, true)?;
        Ok(BlockSubmitter { mmap, sequence: 0 })
    }

    /// Hand a winning block back to the node.
    pub fn submit(&mut self, header: &BlockHeader, coinbase: &[u8]) -> Result<(), ShmError> {
        if coinbase.len() > MAX_SUBMIT_COINBASE {
            return Err(ShmError::CoinbaseTooLarge(coinbase.len()));
        }

        let serialized = header.serialize();
        let base = self.mmap.as_mut_ptr();
        // Safety: offsets bounded by SUBMIT_REGION_SIZE.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (coinbase.len() as u32).to_le_bytes().as_ptr(),
                base.add(8),
                4,
            );
            std::ptr::copy_nonoverlapping(serialized.as_ptr(), base.add(12), HEADER_SIZE);
            std::ptr::copy_nonoverlapping(coinbase.as_ptr(), base.add(12 + HEADER_SIZE), coinbase.len());
        }

        self.sequence += 1;
        sequence_word(&self.mmap).store(self.sequence, Ordering::Release);
        info!("block submitted through shared memory (seq {})", self.sequence);
        Ok(())
    }
}

/// Reader for the return channel (the node side; here mainly for tests).
pub struct SubmitRegionReader {
    mmap: MmapMut,
}

impl SubmitRegionReader {
    /// Map an existing submit region.
    pub fn open(path: &Path) -> Result<Self, ShmError> {
        let mmap = map_file(path, SUBMIT_REGION_SIZE, false)?;
        Ok(SubmitRegionReader { mmap })
    }

    /// Read the latest submission, if any past `last_seen`.
    pub fn try_read(
        &self,
        last_seen: u64,
    ) -> Result<Option<(u64, BlockHeader, Vec<u8>)>, ShmError> {
        let sequence = sequence_word(&self.mmap);

        loop {
            let s1 = sequence.load(Ordering::Acquire);
            if s1 == last_seen || s1 == 0 {
                return Ok(None);
            }

            let base = self.mmap.as_ptr();
            let mut len_word = [0u8; 4];
            let mut header_raw = [0u8; HEADER_SIZE];
            // Safety: offsets bounded by SUBMIT_REGION_SIZE.
            let coinbase = unsafe {
                std::ptr::copy_nonoverlapping(base.add(8), len_word.as_mut_ptr(), 4);
                let len = (u32::from_le_bytes(len_word) as usize).min(MAX_SUBMIT_COINBASE);
                std::ptr::copy_nonoverlapping(base.add(12), header_raw.as_mut_ptr(), HEADER_SIZE);
                let mut coinbase = vec![0u8; len];
                std::ptr::copy_nonoverlapping(base.add(12 + HEADER_SIZE), coinbase.as_mut_ptr(), len);
                coinbase
            };

            fence(Ordering::Acquire);
            if sequence.load(Ordering::Acquire) == s1 {
                let header = BlockHeader::deserialize(&header_raw)
                    .map_err(|_| ShmError::BadState(0))?;
                return Ok(Some((s1, header, coinbase)));
            }
        }
    }
}
