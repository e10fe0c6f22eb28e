//! ASIC-Facing TCP Server
//!
//! Accepts device connections, assigns each an extranonce through the job
//! manager, and runs one receive and one send task per connection. Jobs
//! travel through a watch slot so a new job always supersedes an unsent one;
//! other frames go through a small drop-oldest queue that can never starve a
//! job. Devices that miss too many heartbeats are disconnected; a
//! wire-parsing error disconnects only the offending connection.

use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

use quaxis_mining::{Job, JobManager, Share, ShareOutcome, ShareValidator};

use crate::protocol::{AsicCodec, Frame};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener could not be set up
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: String,

    /// Connection cap; further accepts are dropped
    pub max_connections: usize,

    /// Heartbeat ping interval
    pub heartbeat_interval: Duration,

    /// Missed heartbeat replies before disconnect
    pub max_missed_heartbeats: u32,

    /// Soft bound of the per-connection control queue
    pub control_queue_bound: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:9833".to_string(),
            max_connections: 128,
            heartbeat_interval: Duration::from_secs(15),
            max_missed_heartbeats: 3,
            control_queue_bound: 64,
        }
    }
}

/// Last status report from a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Reported hashrate, GH/s
    pub hashrate: u32,

    /// Board temperature, Celsius
    pub temperature: u8,

    /// Fan duty, percent
    pub fan: u8,

    /// Device-side error count
    pub errors: u16,
}

/// Server counters for the telemetry surface.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    shares_received: AtomicU64,
    protocol_disconnects: AtomicU64,
    heartbeat_disconnects: AtomicU64,
}

/// Point-in-time copy of the server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    /// Connections accepted since start
    pub total_connections: u64,

    /// Connections currently live
    pub active_connections: usize,

    /// Share frames received
    pub shares_received: u64,

    /// Disconnects caused by wire-parsing errors
    pub protocol_disconnects: u64,

    /// Disconnects caused by missed heartbeats
    pub heartbeat_disconnects: u64,

    /// Sum of device-reported hashrate, GH/s
    pub fleet_hashrate: u64,
}

/// Drop-oldest bounded queue for non-job frames.
struct ControlQueue {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    bound: usize,
}

impl ControlQueue {
    fn new(bound: usize) -> Self {
        ControlQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            bound,
        }
    }

    /// Enqueue, dropping the oldest entry past the bound. Jobs do not pass
    /// through here, so only auxiliary traffic is ever shed.
    fn push(&self, frame: Frame) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.bound {
            queue.pop_front();
            debug!("control queue full, dropped oldest frame");
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Frame {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.queue.lock().unwrap().pop_front() {
                return frame;
            }
            notified.await;
        }
    }
}

struct ConnectionHandle {
    addr: SocketAddr,
    job_tx: watch::Sender<Option<Frame>>,
    control: Arc<ControlQueue>,
    missed: Arc<AtomicU32>,
    status: Arc<Mutex<DeviceStatus>>,
}

/// The ASIC-facing server.
pub struct AsicServer {
    config: ServerConfig,
    job_manager: Arc<JobManager>,
    validator: Arc<ShareValidator>,
    connections: Arc<Mutex<HashMap<u32, Arc<ConnectionHandle>>>>,
    next_connection_id: AtomicU32,
    stats: Arc<ServerStats>,
}

impl AsicServer {
    /// Create a server over the given pipeline components.
    pub fn new(
        config: ServerConfig,
        job_manager: Arc<JobManager>,
        validator: Arc<ShareValidator>,
    ) -> Arc<Self> {
        Arc::new(AsicServer {
            config,
            job_manager,
            validator,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id: AtomicU32::new(1),
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address (useful with a port-zero bind).
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        let addr = listener.local_addr()?;
        info!("ASIC server listening on {addr}");

        let server = self.clone();
        tokio::spawn(async move {
            server.accept_loop(listener, shutdown).await;
        });
        Ok(addr)
    }

    /// Mint and push a fresh job to every connected device. Called on each
    /// template change; each device gets a job bound to its own extranonce.
    pub fn broadcast_jobs(&self) {
        let handles: Vec<(u32, Arc<ConnectionHandle>)> = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(|(&id, handle)| (id, handle.clone()))
            .collect();

        for (connection_id, handle) in handles {
            match self.job_manager.mint_for_connection(connection_id) {
                Ok(job) => {
                    handle.control.push(Frame::SetTarget(job.target.0));
                    let _ = handle.job_tx.send(Some(job_frame(&job)));
                }
                Err(e) => debug!("no job for connection {connection_id}: {e}"),
            }
        }
    }

    /// Tell every device to stop searching (all sources lost, shutdown).
    pub fn broadcast_stop(&self) {
        let connections = self.connections.lock().unwrap();
        for handle in connections.values() {
            handle.control.push(Frame::Stop);
        }
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Counters plus the fleet hashrate sum.
    pub fn stats(&self) -> ServerStatsSnapshot {
        let connections = self.connections.lock().unwrap();
        let fleet_hashrate = connections
            .values()
            .map(|h| h.status.lock().unwrap().hashrate as u64)
            .sum();

        ServerStatsSnapshot {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: connections.len(),
            shares_received: self.stats.shares_received.load(Ordering::Relaxed),
            protocol_disconnects: self.stats.protocol_disconnects.load(Ordering::Relaxed),
            heartbeat_disconnects: self.stats.heartbeat_disconnects.load(Ordering::Relaxed),
            fleet_hashrate,
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if self.connection_count() >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {addr}");
                                continue;
                            }
                            let connection_id =
                                self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                            let server = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, addr, connection_id, shutdown).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        }

        // Drain: tell devices to stop, then let the send loops flush out.
        info!("ASIC server shutting down, stopping {} devices", self.connection_count());
        self.broadcast_stop();
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        connection_id: u32,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {addr}: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, AsicCodec::new());
        let mut writer = FramedWrite::new(write_half, AsicCodec::new());

        let (job_tx, mut job_rx) = watch::channel::<Option<Frame>>(None);
        let handle = Arc::new(ConnectionHandle {
            addr,
            job_tx,
            control: Arc::new(ControlQueue::new(self.config.control_queue_bound)),
            missed: Arc::new(AtomicU32::new(0)),
            status: Arc::new(Mutex::new(DeviceStatus::default())),
        });
        self.connections
            .lock()
            .unwrap()
            .insert(connection_id, handle.clone());
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        info!("ASIC connected: {addr} (connection {connection_id})");

        // Admit: target first, then the first job against this connection's
        // extranonce.
        match self.job_manager.mint_for_connection(connection_id) {
            Ok(job) => {
                handle.control.push(Frame::SetTarget(job.target.0));
                let _ = handle.job_tx.send(Some(job_frame(&job)));
            }
            Err(e) => debug!("admitting {addr} without a job: {e}"),
        }

        // Send loop: control drains ahead of jobs so the admit-time target
        // precedes the first job; a superseded job is simply never observed.
        // `closed` lets a send-side disconnect (missed heartbeats) end the
        // receive loop too.
        let (closed_tx, mut closed_rx) = watch::channel(false);
        let send_handle = handle.clone();
        let send_config = self.config.clone();
        let send_stats = self.stats.clone();
        let mut send_shutdown = shutdown.clone();
        let mut send_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(send_config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            heartbeat.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    biased;

                    changed = send_shutdown.changed() => {
                        if changed.is_err() || *send_shutdown.borrow() {
                            let _ = writer.send(Frame::Stop).await;
                            break;
                        }
                    }
                    frame = send_handle.control.pop() => {
                        let stopping = matches!(frame, Frame::Stop);
                        if writer.send(frame).await.is_err() {
                            break;
                        }
                        if stopping {
                            break;
                        }
                    }
                    changed = job_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let frame = job_rx.borrow_and_update().clone();
                        if let Some(frame) = frame {
                            if writer.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        let missed = send_handle.missed.fetch_add(1, Ordering::Relaxed) + 1;
                        if missed > send_config.max_missed_heartbeats {
                            warn!(
                                "{} missed {missed} heartbeats, disconnecting",
                                send_handle.addr
                            );
                            send_stats
                                .heartbeat_disconnects
                                .fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        if writer.send(Frame::Heartbeat).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = closed_tx.send(true);
        });

        // Receive loop on this task.
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = closed_rx.changed() => break,
                frame = reader.next() => {
                    match frame {
                        None => break,
                        Some(Err(e)) => {
                            // A peer this confused gets a clean slate.
                            warn!("protocol error from {addr}: {e}; disconnecting");
                            self.stats.protocol_disconnects.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        Some(Ok(frame)) => {
                            handle.missed.store(0, Ordering::Relaxed);
                            self.process_frame(connection_id, addr, frame, &handle);
                        }
                    }
                }
            }
        }

        // Unregister first so job broadcasts stop targeting this device,
        // then give the send loop a moment to flush its final frames.
        self.connections.lock().unwrap().remove(&connection_id);
        self.job_manager.release_connection(connection_id);
        if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
            .await
            .is_err()
        {
            send_task.abort();
        }
        info!("ASIC disconnected: {addr} (connection {connection_id})");
    }

    fn process_frame(
        &self,
        connection_id: u32,
        addr: SocketAddr,
        frame: Frame,
        handle: &ConnectionHandle,
    ) {
        match frame {
            Frame::ShareV1 { job_id, nonce } => {
                self.ingest_share(addr, Share { job_id, nonce, version: None });
            }
            Frame::ShareV2 { job_id, nonce, version } => {
                self.ingest_share(
                    addr,
                    Share {
                        job_id,
                        nonce,
                        version: Some(version),
                    },
                );
            }
            Frame::HeartbeatReply => trace!("heartbeat reply from {addr}"),
            Frame::Heartbeat => {
                // Device-initiated ping; answer in kind.
                handle.control.push(Frame::Heartbeat);
            }
            Frame::Status {
                hashrate,
                temperature,
                fan,
                errors,
            } => {
                *handle.status.lock().unwrap() = DeviceStatus {
                    hashrate,
                    temperature,
                    fan,
                    errors,
                };
                trace!("status from {addr}: {hashrate} GH/s, {temperature}C, {errors} errors");
            }
            Frame::DeviceError { code, reason } => {
                warn!("device error from {addr} (connection {connection_id}): {code:#06x} {reason}");
            }
            other => {
                debug!("ignoring server-bound frame {other:?} from {addr}");
            }
        }
    }

    fn ingest_share(&self, addr: SocketAddr, share: Share) {
        self.stats.shares_received.fetch_add(1, Ordering::Relaxed);
        // Validation is CPU-bound but takes microseconds; it runs right here
        // on the ingesting task.
        let result = self.validator.validate(&share);
        match result.outcome {
            ShareOutcome::BlockFound => {
                info!("share from {addr} is a block (job {})", share.job_id);
            }
            ShareOutcome::ValidPartial | ShareOutcome::TargetNotMet => {
                trace!("share from {addr}: {:?}", result.outcome);
            }
            outcome => debug!("share from {addr} rejected: {outcome:?}"),
        }
    }
}

fn job_frame(job: &Job) -> Frame {
    Frame::NewJob {
        midstate: job.midstate.to_le_bytes(),
        header_tail: job.header_tail,
        job_id: job.job_id,
    }
}
