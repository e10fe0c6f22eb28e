//! FIBRE Chunk Framing
//!
//! Each UDP datagram carries one chunk of a block being relayed:
//!
//! ```text
//! magic[4] || version[1] || flags[1] || chunk_id[2] || block_height[4] ||
//! block_hash[32] || total_chunks[2] || data_chunks[2] || payload_size[2] ||
//! payload[payload_size]
//! ```
//!
//! Chunk ids below `data_chunks` are block data in order; the rest are XOR
//! parity. All integers little-endian.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use quaxis_core::Hash256;

/// Frame magic
pub const FIBRE_MAGIC: [u8; 4] = *b"QXFB";

/// Protocol version this build speaks
pub const FIBRE_VERSION: u8 = 1;

/// Fixed header size before the payload
pub const FRAME_HEADER_SIZE: usize = 50;

/// Frame decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Wrong magic bytes
    #[error("Bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// Unknown protocol version
    #[error("Unsupported relay protocol version {0}")]
    UnsupportedVersion(u8),

    /// Datagram shorter than the fixed header
    #[error("Truncated frame: {0} bytes")]
    Truncated(usize),

    /// payload_size disagrees with the datagram length
    #[error("Payload length mismatch: header says {expected}, got {actual}")]
    PayloadLength { expected: usize, actual: usize },

    /// chunk_id does not fit the advertised geometry
    #[error("Chunk id {chunk_id} out of range for {total_chunks} chunks")]
    ChunkOutOfRange { chunk_id: u16, total_chunks: u16 },
}

/// One relayed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibreFrame {
    /// Frame flags (reserved)
    pub flags: u8,

    /// Index of this chunk
    pub chunk_id: u16,

    /// Height of the block being relayed
    pub block_height: u32,

    /// Hash of the block being relayed
    pub block_hash: Hash256,

    /// Data plus parity chunk count
    pub total_chunks: u16,

    /// Data chunk count
    pub data_chunks: u16,

    /// Chunk payload
    pub payload: Vec<u8>,
}

impl FibreFrame {
    /// True for parity chunks.
    pub fn is_parity(&self) -> bool {
        self.chunk_id >= self.data_chunks
    }

    /// Serialize into a datagram.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&FIBRE_MAGIC);
        buf.put_u8(FIBRE_VERSION);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.chunk_id);
        buf.put_u32_le(self.block_height);
        buf.put_slice(self.block_hash.as_bytes());
        buf.put_u16_le(self.total_chunks);
        buf.put_u16_le(self.data_chunks);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parse a datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self, FrameError> {
        if datagram.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated(datagram.len()));
        }

        let mut buf = datagram;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != FIBRE_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let version = buf.get_u8();
        if version != FIBRE_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let flags = buf.get_u8();
        let chunk_id = buf.get_u16_le();
        let block_height = buf.get_u32_le();
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        let total_chunks = buf.get_u16_le();
        let data_chunks = buf.get_u16_le();
        let payload_size = buf.get_u16_le() as usize;

        if buf.remaining() != payload_size {
            return Err(FrameError::PayloadLength {
                expected: payload_size,
                actual: buf.remaining(),
            });
        }
        if chunk_id >= total_chunks || data_chunks == 0 || data_chunks > total_chunks {
            return Err(FrameError::ChunkOutOfRange {
                chunk_id,
                total_chunks,
            });
        }

        Ok(FibreFrame {
            flags,
            chunk_id,
            block_height,
            block_hash: Hash256(hash),
            total_chunks,
            data_chunks,
            payload: buf.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FibreFrame {
        FibreFrame {
            flags: 0,
            chunk_id: 3,
            block_height: 800_000,
            block_hash: Hash256([0x5a; 32]),
            total_chunks: 150,
            data_chunks: 100,
            payload: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn test_round_trip() {
        let original = frame();
        let parsed = FibreFrame::parse(&original.serialize()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_parity_classification() {
        let mut f = frame();
        assert!(!f.is_parity());
        f.chunk_id = 100;
        assert!(f.is_parity());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = frame().serialize();
        bytes[0] = b'X';
        assert!(matches!(
            FibreFrame::parse(&bytes),
            Err(FrameError::BadMagic(_))
        ));
    }

    #[test]
    fn test_rejects_truncated() {
        let bytes = frame().serialize();
        assert!(matches!(
            FibreFrame::parse(&bytes[..20]),
            Err(FrameError::Truncated(20))
        ));
    }

    #[test]
    fn test_rejects_payload_length_mismatch() {
        let mut bytes = frame().serialize();
        bytes.push(0xff);
        assert!(matches!(
            FibreFrame::parse(&bytes),
            Err(FrameError::PayloadLength { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_chunk() {
        let mut f = frame();
        f.chunk_id = 150;
        let bytes = f.serialize();
        assert!(matches!(
            FibreFrame::parse(&bytes),
            Err(FrameError::ChunkOutOfRange { .. })
        ));
    }
}
