//! ASIC-Facing Networking for Quaxis
//!
//! The framed binary protocol spoken by the devices and the TCP server that
//! admits them, assigns extranonces, broadcasts jobs and collects shares.

pub mod protocol;
pub mod server;

pub use protocol::{AsicCodec, Frame, ProtocolError, MAX_ERROR_REASON};
pub use server::{
    AsicServer, DeviceStatus, ServerConfig, ServerError, ServerStatsSnapshot,
};
