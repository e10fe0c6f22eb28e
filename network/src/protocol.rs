//! ASIC Binary Protocol
//!
//! Tiny tag-prefixed frames, little-endian, sized by the tag:
//!
//! | Tag  | Dir | Frame           | Payload                                   |
//! |------|-----|-----------------|-------------------------------------------|
//! | 0x01 | S>A | New job         | midstate[32] header_tail[12] job_id[4]    |
//! | 0x02 | S>A | Stop            | -                                         |
//! | 0x03 | <>  | Heartbeat       | -                                         |
//! | 0x04 | S>A | Set target      | target[32]                                |
//! | 0x05 | S>A | Set difficulty  | difficulty[4, f32]                        |
//! | 0x81 | A>S | Share v1        | job_id[4] nonce[4]                        |
//! | 0x82 | A>S | Share v2        | job_id[4] nonce[4] version[4]             |
//! | 0x83 | A>S | Heartbeat reply | -                                         |
//! | 0x84 | A>S | Status          | hashrate[4] temp[1] fan[1] errors[2]      |
//! | 0x8F | A>S | Error           | code[2] reason_len[1] reason[reason_len]  |
//!
//! An unknown tag is a single junk byte: the decoder drops it and
//! resynchronizes on the next byte.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame tags
pub mod tag {
    pub const NEW_JOB: u8 = 0x01;
    pub const STOP: u8 = 0x02;
    pub const HEARTBEAT: u8 = 0x03;
    pub const SET_TARGET: u8 = 0x04;
    pub const SET_DIFFICULTY: u8 = 0x05;
    pub const SHARE_V1: u8 = 0x81;
    pub const SHARE_V2: u8 = 0x82;
    pub const HEARTBEAT_REPLY: u8 = 0x83;
    pub const STATUS: u8 = 0x84;
    pub const DEVICE_ERROR: u8 = 0x8f;
}

/// Longest error reason a device may attach
pub const MAX_ERROR_REASON: usize = 255;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Outgoing error reason exceeds the one-byte length prefix
    #[error("Error reason of {0} bytes does not fit the frame")]
    ReasonTooLong(usize),
}

/// One protocol frame, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Work assignment
    NewJob {
        /// Header midstate, state words little-endian
        midstate: [u8; 32],

        /// merkle_root[28..32] || timestamp || bits
        header_tail: [u8; 12],

        /// Job identifier
        job_id: u32,
    },

    /// Stop searching
    Stop,

    /// Liveness ping
    Heartbeat,

    /// Full 256-bit target update
    SetTarget([u8; 32]),

    /// Difficulty update (pool-style convenience)
    SetDifficulty(f32),

    /// Found nonce
    ShareV1 {
        /// Job the nonce belongs to
        job_id: u32,

        /// The nonce
        nonce: u32,
    },

    /// Found nonce with rolled version
    ShareV2 {
        /// Job the nonce belongs to
        job_id: u32,

        /// The nonce
        nonce: u32,

        /// Rolled header version
        version: u32,
    },

    /// Liveness pong
    HeartbeatReply,

    /// Periodic device report
    Status {
        /// Device-reported hashrate, GH/s
        hashrate: u32,

        /// Board temperature, Celsius
        temperature: u8,

        /// Fan duty, percent
        fan: u8,

        /// Device-side error count
        errors: u16,
    },

    /// Device fault report
    DeviceError {
        /// Fault code
        code: u16,

        /// Human-readable reason
        reason: String,
    },
}

/// Fixed payload size per tag; `None` for unknown tags.
fn fixed_payload_len(tag_byte: u8) -> Option<usize> {
    match tag_byte {
        tag::NEW_JOB => Some(48),
        tag::STOP | tag::HEARTBEAT | tag::HEARTBEAT_REPLY => Some(0),
        tag::SET_TARGET => Some(32),
        tag::SET_DIFFICULTY => Some(4),
        tag::SHARE_V1 => Some(8),
        tag::SHARE_V2 => Some(12),
        tag::STATUS => Some(8),
        // DEVICE_ERROR is variable; handled separately.
        _ => None,
    }
}

/// Codec for the framed ASIC protocol.
#[derive(Debug, Default)]
pub struct AsicCodec {
    resyncs: u64,
}

impl AsicCodec {
    /// Create a codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Junk bytes skipped while resynchronizing.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

impl Decoder for AsicCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let tag_byte = match src.first() {
                Some(&byte) => byte,
                None => return Ok(None),
            };

            if tag_byte == tag::DEVICE_ERROR {
                // tag + code[2] + reason_len[1] + reason
                if src.len() < 4 {
                    return Ok(None);
                }
                let reason_len = src[3] as usize;
                if src.len() < 4 + reason_len {
                    return Ok(None);
                }
                src.advance(1);
                let code = src.get_u16_le();
                src.advance(1);
                let reason_bytes = src.split_to(reason_len);
                let reason = String::from_utf8_lossy(&reason_bytes).into_owned();
                return Ok(Some(Frame::DeviceError { code, reason }));
            }

            let payload_len = match fixed_payload_len(tag_byte) {
                Some(len) => len,
                None => {
                    // Unknown tag: drop the byte and resynchronize.
                    src.advance(1);
                    self.resyncs += 1;
                    continue;
                }
            };

            if src.len() < 1 + payload_len {
                src.reserve(1 + payload_len - src.len());
                return Ok(None);
            }
            src.advance(1);

            let frame = match tag_byte {
                tag::NEW_JOB => {
                    let mut midstate = [0u8; 32];
                    src.copy_to_slice(&mut midstate);
                    let mut header_tail = [0u8; 12];
                    src.copy_to_slice(&mut header_tail);
                    let job_id = src.get_u32_le();
                    Frame::NewJob {
                        midstate,
                        header_tail,
                        job_id,
                    }
                }
                tag::STOP => Frame::Stop,
                tag::HEARTBEAT => Frame::Heartbeat,
                tag::SET_TARGET => {
                    let mut target = [0u8; 32];
                    src.copy_to_slice(&mut target);
                    Frame::SetTarget(target)
                }
                tag::SET_DIFFICULTY => Frame::SetDifficulty(f32::from_le_bytes([
                    src.get_u8(),
                    src.get_u8(),
                    src.get_u8(),
                    src.get_u8(),
                ])),
                tag::SHARE_V1 => Frame::ShareV1 {
                    job_id: src.get_u32_le(),
                    nonce: src.get_u32_le(),
                },
                tag::SHARE_V2 => Frame::ShareV2 {
                    job_id: src.get_u32_le(),
                    nonce: src.get_u32_le(),
                    version: src.get_u32_le(),
                },
                tag::HEARTBEAT_REPLY => Frame::HeartbeatReply,
                tag::STATUS => Frame::Status {
                    hashrate: src.get_u32_le(),
                    temperature: src.get_u8(),
                    fan: src.get_u8(),
                    errors: src.get_u16_le(),
                },
                _ => unreachable!("tag filtered above"),
            };
            return Ok(Some(frame));
        }
    }
}

impl Encoder<Frame> for AsicCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match frame {
            Frame::NewJob {
                midstate,
                header_tail,
                job_id,
            } => {
                dst.reserve(49);
                dst.put_u8(tag::NEW_JOB);
                dst.put_slice(&midstate);
                dst.put_slice(&header_tail);
                dst.put_u32_le(job_id);
            }
            Frame::Stop => dst.put_u8(tag::STOP),
            Frame::Heartbeat => dst.put_u8(tag::HEARTBEAT),
            Frame::SetTarget(target) => {
                dst.reserve(33);
                dst.put_u8(tag::SET_TARGET);
                dst.put_slice(&target);
            }
            Frame::SetDifficulty(difficulty) => {
                dst.reserve(5);
                dst.put_u8(tag::SET_DIFFICULTY);
                dst.put_slice(&difficulty.to_le_bytes());
            }
            Frame::ShareV1 { job_id, nonce } => {
                dst.reserve(9);
                dst.put_u8(tag::SHARE_V1);
                dst.put_u32_le(job_id);
                dst.put_u32_le(nonce);
            }
            Frame::ShareV2 {
                job_id,
                nonce,
                version,
            } => {
                dst.reserve(13);
                dst.put_u8(tag::SHARE_V2);
                dst.put_u32_le(job_id);
                dst.put_u32_le(nonce);
                dst.put_u32_le(version);
            }
            Frame::HeartbeatReply => dst.put_u8(tag::HEARTBEAT_REPLY),
            Frame::Status {
                hashrate,
                temperature,
                fan,
                errors,
            } => {
                dst.reserve(9);
                dst.put_u8(tag::STATUS);
                dst.put_u32_le(hashrate);
                dst.put_u8(temperature);
                dst.put_u8(fan);
                dst.put_u16_le(errors);
            }
            Frame::DeviceError { code, reason } => {
                let reason_bytes = reason.as_bytes();
                if reason_bytes.len() > MAX_ERROR_REASON {
                    return Err(ProtocolError::ReasonTooLong(reason_bytes.len()));
                }
                dst.reserve(4 + reason_bytes.len());
                dst.put_u8(tag::DEVICE_ERROR);
                dst.put_u16_le(code);
                dst.put_u8(reason_bytes.len() as u8);
                dst.put_slice(reason_bytes);
            }
        }
        Ok(())
    }
}
