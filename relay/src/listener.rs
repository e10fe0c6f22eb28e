//! UDP Relay Listener
//!
//! Receives FIBRE datagrams, feeds them through the block reconstructor, and
//! publishes the results as tip events: an early header becomes a
//! speculative tip, a completed block a confirmed one. Deduplication across
//! sources is the fallback manager's job, not this listener's.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use quaxis_core::TipEvent;

use crate::fibre::FibreFrame;
use crate::reconstructor::{BlockReconstructor, ReconstructorConfig, RelayEvent};

/// Relay listener errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket setup or receive failure
    #[error("Relay I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct RelayListenerConfig {
    /// UDP bind address, e.g. "0.0.0.0:8336"
    pub bind: String,

    /// Coinbase value assumed for templates derived from relayed blocks
    pub default_coinbase_value: i64,

    /// Bound on each receive wait, so shutdown is always observed
    pub recv_timeout: Duration,

    /// Reconstruction bounds
    pub reconstructor: ReconstructorConfig,
}

impl Default for RelayListenerConfig {
    fn default() -> Self {
        RelayListenerConfig {
            bind: "0.0.0.0:8336".to_string(),
            default_coinbase_value: 312_500_000,
            recv_timeout: Duration::from_millis(250),
            reconstructor: ReconstructorConfig::default(),
        }
    }
}

/// Relay counters for the telemetry surface.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Datagrams that parsed as chunks
    pub chunks_received: AtomicU64,

    /// Datagrams that did not parse
    pub malformed_frames: AtomicU64,

    /// Early headers published
    pub headers_published: AtomicU64,

    /// Blocks fully reconstructed
    pub blocks_reconstructed: AtomicU64,
}

/// The UDP listener task.
pub struct RelayListener {
    config: RelayListenerConfig,
    stats: Arc<RelayStats>,
}

impl RelayListener {
    /// Create a listener; `stats` may be shared with the telemetry reporter.
    pub fn new(config: RelayListenerConfig, stats: Arc<RelayStats>) -> Self {
        RelayListener { config, stats }
    }

    /// Receive until shutdown. Tip events go to `tip_tx`.
    pub async fn run(
        self,
        tip_tx: mpsc::Sender<TipEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        let socket = UdpSocket::bind(&self.config.bind).await?;
        info!("relay listener on {}", self.config.bind);

        let mut reconstructor = BlockReconstructor::new(self.config.reconstructor.clone());
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = tokio::time::timeout(
                    self.config.recv_timeout,
                    socket.recv_from(&mut buf),
                ) => {
                    let (len, peer) = match received {
                        // Timeout: loop around so shutdown stays responsive.
                        Err(_) => continue,
                        Ok(Err(e)) => {
                            warn!("relay receive failed: {e}");
                            continue;
                        }
                        Ok(Ok(pair)) => pair,
                    };

                    let frame = match FibreFrame::parse(&buf[..len]) {
                        Ok(frame) => frame,
                        Err(e) => {
                            self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                            debug!("malformed datagram from {peer}: {e}");
                            continue;
                        }
                    };
                    self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);

                    let events = match reconstructor.ingest(&frame) {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("chunk from {peer} rejected: {e}");
                            continue;
                        }
                    };

                    for event in events {
                        let tip = self.to_tip_event(event);
                        if let Some(tip) = tip {
                            if tip_tx.send(tip).await.is_err() {
                                info!("tip channel closed, relay listener exiting");
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        info!("relay listener stopped");
        Ok(())
    }

    fn to_tip_event(&self, event: RelayEvent) -> Option<TipEvent> {
        match event {
            RelayEvent::SpeculativeHeader { header, height, hash } => {
                if header.hash() != hash {
                    warn!("early header of {} does not hash to its announcement", hash);
                    return None;
                }
                self.stats.headers_published.fetch_add(1, Ordering::Relaxed);
                Some(TipEvent {
                    prev_hash: hash,
                    height: height + 1,
                    bits: header.bits,
                    timestamp: header.timestamp,
                    coinbase_value: self.config.default_coinbase_value,
                    speculative: true,
                })
            }
            RelayEvent::BlockComplete { header, payload, hash, height } => {
                if header.hash() != hash {
                    warn!("reconstructed block {} does not hash to its announcement", hash);
                    return None;
                }
                self.stats.blocks_reconstructed.fetch_add(1, Ordering::Relaxed);
                debug!("block {} complete, {} bytes", hash, payload.len());
                Some(TipEvent {
                    prev_hash: hash,
                    height: height + 1,
                    bits: header.bits,
                    timestamp: header.timestamp,
                    coinbase_value: self.config.default_coinbase_value,
                    speculative: false,
                })
            }
        }
    }
}
