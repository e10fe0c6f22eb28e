//! FIBRE-Style Block Relay for Quaxis
//!
//! Low-latency block ingestion over lossy UDP: chunk framing, XOR-parity FEC
//! recovery, per-block reconstruction with early header extraction, and a
//! listener task that turns both into tip events.

pub mod fec;
pub mod fibre;
pub mod listener;
pub mod reconstructor;

pub use fec::{encode_parity, parity_subset, FecDecoder};
pub use fibre::{FibreFrame, FrameError, FIBRE_MAGIC, FIBRE_VERSION, FRAME_HEADER_SIZE};
pub use listener::{RelayError, RelayListener, RelayListenerConfig, RelayStats};
pub use reconstructor::{
    BlockReconstructor, ReconstructError, ReconstructorConfig, RelayEvent,
};
