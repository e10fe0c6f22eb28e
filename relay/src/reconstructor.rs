//! Block Reconstruction from Relay Chunks
//!
//! Collects FIBRE chunks per block hash, recovers losses through the FEC
//! decoder, and surfaces two events:
//! - `SpeculativeHeader` the moment chunk 0 arrives (the 80-byte header is
//!   independent of the rest of the block, so spy mining can start at once).
//! - `BlockComplete` when the data chunks are all present or recovered.
//!
//! Reconstructions are bounded: a TTL drops stragglers, an LRU cap bounds
//! concurrent downloads, and completed hashes are remembered so repeated
//! chunks are ignored.

use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

use quaxis_core::{BlockHeader, Hash256, HEADER_SIZE};

use crate::fec::FecDecoder;
use crate::fibre::FibreFrame;

/// How many completed block hashes to remember for idempotence
const COMPLETED_WINDOW: usize = 64;

/// Reconstruction errors
#[derive(Debug, Error)]
pub enum ReconstructError {
    /// A chunk contradicted the geometry announced by earlier chunks
    #[error("Chunk geometry mismatch for block {block}: {details}")]
    GeometryMismatch { block: Hash256, details: String },

    /// The completed payload did not contain a parseable header
    #[error("Reconstructed block {0} has no valid header")]
    BadHeader(Hash256),
}

/// Reconstructor tuning.
#[derive(Debug, Clone)]
pub struct ReconstructorConfig {
    /// Drop reconstructions older than this
    pub ttl: Duration,

    /// Maximum concurrent reconstructions
    pub max_concurrent: usize,
}

impl Default for ReconstructorConfig {
    fn default() -> Self {
        ReconstructorConfig {
            ttl: Duration::from_secs(30),
            max_concurrent: 8,
        }
    }
}

/// Events surfaced while ingesting chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Header extracted early from chunk 0; the block is not yet complete
    SpeculativeHeader {
        /// Parsed 80-byte header
        header: BlockHeader,

        /// Height announced in the frames
        height: u32,

        /// Hash announced in the frames
        hash: Hash256,
    },

    /// All data chunks present; the block payload is assembled
    BlockComplete {
        /// Parsed header from the payload's first 80 bytes
        header: BlockHeader,

        /// Full block payload
        payload: Vec<u8>,

        /// Hash announced in the frames
        hash: Hash256,

        /// Height announced in the frames
        height: u32,
    },
}

struct Reconstruction {
    decoder: FecDecoder,
    height: u32,
    total_chunks: u16,
    data_chunks: u16,
    header_published: bool,
    last_update: Instant,
    created: Instant,
}

/// Assembles blocks from chunks, one reconstruction per block hash.
pub struct BlockReconstructor {
    config: ReconstructorConfig,
    active: HashMap<Hash256, Reconstruction>,
    completed: VecDeque<Hash256>,
}

impl BlockReconstructor {
    /// Create with the given bounds.
    pub fn new(config: ReconstructorConfig) -> Self {
        BlockReconstructor {
            config,
            active: HashMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_WINDOW),
        }
    }

    /// Ingest one chunk, returning any events it triggered.
    pub fn ingest(&mut self, frame: &FibreFrame) -> Result<Vec<RelayEvent>, ReconstructError> {
        // Already fully ingested: repeated datagrams are expected and silent.
        if self.completed.contains(&frame.block_hash) {
            trace!("chunk for completed block {} ignored", frame.block_hash);
            return Ok(Vec::new());
        }

        self.evict_expired();

        if let Some(existing) = self.active.get(&frame.block_hash) {
            if existing.total_chunks != frame.total_chunks
                || existing.data_chunks != frame.data_chunks
            {
                return Err(ReconstructError::GeometryMismatch {
                    block: frame.block_hash,
                    details: format!(
                        "have {}/{}, frame says {}/{}",
                        existing.data_chunks,
                        existing.total_chunks,
                        frame.data_chunks,
                        frame.total_chunks
                    ),
                });
            }
        } else {
            self.make_room();
            debug!(
                "new reconstruction for block {} at height {} ({} data / {} total)",
                frame.block_hash, frame.block_height, frame.data_chunks, frame.total_chunks
            );
        }

        let reconstruction = self.active.entry(frame.block_hash).or_insert_with(|| {
            Reconstruction {
                decoder: FecDecoder::new(frame.data_chunks as usize, frame.total_chunks as usize),
                height: frame.block_height,
                total_chunks: frame.total_chunks,
                data_chunks: frame.data_chunks,
                header_published: false,
                last_update: Instant::now(),
                created: Instant::now(),
            }
        });

        reconstruction.last_update = Instant::now();
        reconstruction
            .decoder
            .add_chunk(frame.chunk_id as usize, frame.payload.clone());

        let mut events = Vec::new();

        // Early header extraction: the header always occupies the first 80
        // bytes, so chunk 0 alone is enough to start spy mining.
        if frame.chunk_id == 0
            && !reconstruction.header_published
            && frame.payload.len() >= HEADER_SIZE
        {
            match BlockHeader::deserialize(&frame.payload[..HEADER_SIZE]) {
                Ok(header) => {
                    reconstruction.header_published = true;
                    info!(
                        "early header for block {} at height {}",
                        frame.block_hash, frame.block_height
                    );
                    events.push(RelayEvent::SpeculativeHeader {
                        header,
                        height: reconstruction.height,
                        hash: frame.block_hash,
                    });
                }
                Err(e) => warn!("chunk 0 of {} carries no header: {e}", frame.block_hash),
            }
        }

        if reconstruction.decoder.try_recover() {
            let payload = reconstruction
                .decoder
                .assemble()
                .expect("recover returned complete");
            let height = reconstruction.height;
            self.active.remove(&frame.block_hash);
            self.remember_completed(frame.block_hash);

            if payload.len() < HEADER_SIZE {
                return Err(ReconstructError::BadHeader(frame.block_hash));
            }
            let header = BlockHeader::deserialize(&payload[..HEADER_SIZE])
                .map_err(|_| ReconstructError::BadHeader(frame.block_hash))?;

            info!(
                "block {} reconstructed at height {} ({} bytes)",
                frame.block_hash,
                height,
                payload.len()
            );
            events.push(RelayEvent::BlockComplete {
                header,
                payload,
                hash: frame.block_hash,
                height,
            });
        }

        Ok(events)
    }

    /// Number of in-flight reconstructions.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn evict_expired(&mut self) {
        let ttl = self.config.ttl;
        self.active.retain(|hash, r| {
            let keep = r.created.elapsed() <= ttl;
            if !keep {
                warn!("reconstruction of {} timed out", hash);
            }
            keep
        });
    }

    fn make_room(&mut self) {
        while self.active.len() >= self.config.max_concurrent {
            // Drop the least recently updated reconstruction.
            let oldest = self
                .active
                .iter()
                .min_by_key(|(_, r)| r.last_update)
                .map(|(hash, _)| *hash);
            match oldest {
                Some(hash) => {
                    warn!("evicting stalled reconstruction of {}", hash);
                    self.active.remove(&hash);
                }
                None => break,
            }
        }
    }

    fn remember_completed(&mut self, hash: Hash256) {
        if self.completed.len() == COMPLETED_WINDOW {
            self.completed.pop_front();
        }
        self.completed.push_back(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::encode_parity;

    /// Shard a block into equal chunks plus parity frames.
    fn shard(block: &[u8], data_chunks: usize, parity_chunks: usize) -> Vec<FibreFrame> {
        let header = BlockHeader::deserialize(&block[..HEADER_SIZE]).unwrap();
        let hash = header.hash();
        let chunk_len = block.len().div_ceil(data_chunks);

        let mut data: Vec<Vec<u8>> = block
            .chunks(chunk_len)
            .map(|c| c.to_vec())
            .collect();
        while data.len() < data_chunks {
            data.push(Vec::new());
        }
        // Equal lengths keep the XOR parity aligned.
        for chunk in &mut data {
            chunk.resize(chunk_len, 0);
        }

        let parity = encode_parity(&data, parity_chunks);
        let total = (data_chunks + parity_chunks) as u16;

        data.into_iter()
            .chain(parity)
            .enumerate()
            .map(|(i, payload)| FibreFrame {
                flags: 0,
                chunk_id: i as u16,
                block_height: 812_000,
                block_hash: hash,
                total_chunks: total,
                data_chunks: data_chunks as u16,
                payload,
            })
            .collect()
    }

    fn sample_block() -> Vec<u8> {
        let header = BlockHeader {
            version: 0x2000_0000,
            prev_hash: Hash256([0x10; 32]),
            merkle_root: Hash256([0x20; 32]),
            timestamp: 1_700_000_000,
            bits: 0x1f00_ffff,
            nonce: 42,
        };
        let mut block = header.serialize().to_vec();
        block.extend((0..920u32).map(|i| (i % 251) as u8));
        block
    }

    #[test]
    fn test_chunk_zero_publishes_speculative_header() {
        let block = sample_block();
        let frames = shard(&block, 10, 5);
        let mut reconstructor = BlockReconstructor::new(ReconstructorConfig::default());

        let events = reconstructor.ingest(&frames[0]).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            RelayEvent::SpeculativeHeader { header, height, .. } => {
                assert_eq!(header.nonce, 42);
                assert_eq!(*height, 812_000);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Re-sending chunk 0 does not republish the header.
        assert!(reconstructor.ingest(&frames[0]).unwrap().is_empty());
    }

    #[test]
    fn test_out_of_order_with_loss_reconstructs() {
        let block = sample_block();
        let frames = shard(&block, 10, 5);
        let mut reconstructor = BlockReconstructor::new(ReconstructorConfig::default());

        // 20% data loss (chunks 1 and 7, distinct parity groups), delivered
        // in reverse order.
        let mut delivery: Vec<&FibreFrame> = frames
            .iter()
            .filter(|f| f.chunk_id != 1 && f.chunk_id != 7)
            .collect();
        delivery.reverse();

        let mut completed = None;
        for frame in delivery {
            for event in reconstructor.ingest(frame).unwrap() {
                if let RelayEvent::BlockComplete { payload, .. } = event {
                    completed = Some(payload);
                }
            }
        }

        let payload = completed.expect("block not reconstructed");
        // Shard padding may trail; the original block is the prefix.
        assert_eq!(&payload[..block.len()], &block[..]);
        assert_eq!(reconstructor.active_count(), 0);
    }

    #[test]
    fn test_completed_block_is_idempotent() {
        let block = sample_block();
        let frames = shard(&block, 4, 2);
        let mut reconstructor = BlockReconstructor::new(ReconstructorConfig::default());

        let mut done = false;
        for frame in &frames[..4] {
            done |= reconstructor
                .ingest(frame)
                .unwrap()
                .iter()
                .any(|e| matches!(e, RelayEvent::BlockComplete { .. }));
        }
        assert!(done);

        // Stragglers after completion produce nothing.
        assert!(reconstructor.ingest(&frames[4]).unwrap().is_empty());
        assert!(reconstructor.ingest(&frames[0]).unwrap().is_empty());
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let block = sample_block();
        let frames = shard(&block, 4, 2);
        let mut reconstructor = BlockReconstructor::new(ReconstructorConfig::default());
        reconstructor.ingest(&frames[1]).unwrap();

        let mut conflicting = frames[2].clone();
        conflicting.data_chunks = 3;
        conflicting.total_chunks = 5;
        assert!(matches!(
            reconstructor.ingest(&conflicting),
            Err(ReconstructError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn test_lru_cap_bounds_concurrency() {
        let mut reconstructor = BlockReconstructor::new(ReconstructorConfig {
            ttl: Duration::from_secs(60),
            max_concurrent: 2,
        });

        for i in 0..4u8 {
            let frame = FibreFrame {
                flags: 0,
                chunk_id: 1,
                block_height: 100 + i as u32,
                block_hash: Hash256([i; 32]),
                total_chunks: 10,
                data_chunks: 8,
                payload: vec![0; 64],
            };
            reconstructor.ingest(&frame).unwrap();
        }

        assert!(reconstructor.active_count() <= 2);
    }
}
