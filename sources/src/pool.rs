//! Pool Protocol Client
//!
//! The lowest-priority tip source: a line-delimited JSON connection that
//! subscribes, authorizes, and then turns `mining.notify` frames into tip
//! events. Only used when both the shared-memory and relay paths have gone
//! silent past the grace window.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use quaxis_core::{Hash256, TipEvent};

/// Pool client errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// TCP failure
    #[error("Pool I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Line framing failure
    #[error("Pool framing error: {0}")]
    Codec(#[from] LinesCodecError),

    /// Malformed JSON from the pool
    #[error("Pool sent invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The pool rejected our credentials
    #[error("Pool rejected credentials for {0}")]
    Unauthorized(String),

    /// Protocol-shape violation
    #[error("Pool protocol error: {0}")]
    Protocol(String),

    /// A bounded wait elapsed
    #[error("Pool request timed out")]
    Timeout,
}

/// Pool connection settings.
#[derive(Debug, Clone)]
pub struct PoolClientConfig {
    /// host:port of the pool
    pub endpoint: String,

    /// Worker username
    pub username: String,

    /// Worker password
    pub password: String,

    /// Coinbase value assumed for pool-derived templates
    pub default_coinbase_value: i64,

    /// Bound on each request/response wait
    pub request_timeout: Duration,

    /// Reconnect backoff cap
    pub max_backoff: Duration,
}

impl Default for PoolClientConfig {
    fn default() -> Self {
        PoolClientConfig {
            endpoint: "127.0.0.1:3333".to_string(),
            username: "quaxis".to_string(),
            password: "x".to_string(),
            default_coinbase_value: 312_500_000,
            request_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// The pool client task.
pub struct PoolClient {
    config: PoolClientConfig,
}

impl PoolClient {
    /// Create a client.
    pub fn new(config: PoolClientConfig) -> Self {
        PoolClient { config }
    }

    /// Connect-and-read loop with capped exponential backoff. Tip events go
    /// to `tip_tx`; returns on shutdown or a credential rejection.
    pub async fn run(
        self,
        tip_tx: mpsc::Sender<TipEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PoolError> {
        let mut backoff = Duration::from_secs(1);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.session(&tip_tx, &mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(PoolError::Unauthorized(user)) => {
                    return Err(PoolError::Unauthorized(user));
                }
                Err(e) => {
                    warn!("pool session ended: {e}; reconnecting in {backoff:?}");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    async fn session(
        &self,
        tip_tx: &mpsc::Sender<TipEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), PoolError> {
        let stream = tokio::time::timeout(
            self.config.request_timeout,
            TcpStream::connect(&self.config.endpoint),
        )
        .await
        .map_err(|_| PoolError::Timeout)??;
        info!("connected to pool {}", self.config.endpoint);

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(65536));

        // Subscribe, then authorize; both answered by id.
        let subscribe = json!({
            "id": 1,
            "method": "mining.subscribe",
            "params": ["quaxis/0.1.0"]
        });
        framed.send(subscribe.to_string()).await?;
        self.await_result(&mut framed, 1).await?;

        let authorize = json!({
            "id": 2,
            "method": "mining.authorize",
            "params": [self.config.username, self.config.password]
        });
        framed.send(authorize.to_string()).await?;
        let authorized = self.await_result(&mut framed, 2).await?;
        if authorized.as_bool() != Some(true) {
            return Err(PoolError::Unauthorized(self.config.username.clone()));
        }
        info!("pool authorized worker {}", self.config.username);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                line = framed.next() => {
                    let line = match line {
                        Some(line) => line?,
                        None => return Err(PoolError::Protocol("pool closed the connection".into())),
                    };
                    let message: Value = serde_json::from_str(&line)?;

                    match message.get("method").and_then(Value::as_str) {
                        Some("mining.notify") => {
                            match self.parse_notify(&message) {
                                Ok(event) => {
                                    if tip_tx.send(event).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                Err(e) => warn!("unusable notify frame: {e}"),
                            }
                        }
                        Some("mining.set_difficulty") => {
                            debug!("pool difficulty update ignored (solo targets come from bits)");
                        }
                        Some(other) => debug!("ignoring pool method {other}"),
                        None => trace_response(&message),
                    }
                }
            }
        }
    }

    async fn await_result(
        &self,
        framed: &mut Framed<TcpStream, LinesCodec>,
        id: u64,
    ) -> Result<Value, PoolError> {
        loop {
            let line = tokio::time::timeout(self.config.request_timeout, framed.next())
                .await
                .map_err(|_| PoolError::Timeout)?
                .ok_or_else(|| PoolError::Protocol("pool closed during handshake".into()))??;
            let message: Value = serde_json::from_str(&line)?;

            if message.get("id").and_then(Value::as_u64) == Some(id) {
                if let Some(error) = message.get("error").filter(|e| !e.is_null()) {
                    return Err(PoolError::Protocol(format!("request {id} failed: {error}")));
                }
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }
            // Notifies may interleave with handshake responses.
            debug!("deferring frame during handshake: {line}");
        }
    }

    /// Extract template inputs from a notify frame:
    /// [job_id, prev_hash, coinb1, coinb2, branches, version, bits, time, clean]
    fn parse_notify(&self, message: &Value) -> Result<TipEvent, PoolError> {
        let params = message
            .get("params")
            .and_then(Value::as_array)
            .ok_or_else(|| PoolError::Protocol("notify without params".into()))?;
        if params.len() < 9 {
            return Err(PoolError::Protocol(format!(
                "notify has {} params, need 9",
                params.len()
            )));
        }

        let prev_hex = params[1]
            .as_str()
            .ok_or_else(|| PoolError::Protocol("prev hash is not a string".into()))?;
        let prev_hash = Hash256::from_hex(prev_hex)
            .map_err(|e| PoolError::Protocol(format!("bad prev hash: {e}")))?;

        let coinb1 = hex_field(&params[2], "coinb1")?;
        let height = parse_bip34_height(&coinb1)
            .ok_or_else(|| PoolError::Protocol("no BIP34 height in coinb1".into()))?;

        let bits = u32_hex_field(&params[6], "bits")?;
        let timestamp = u32_hex_field(&params[7], "time")?;

        Ok(TipEvent {
            prev_hash,
            height,
            bits,
            timestamp,
            coinbase_value: self.config.default_coinbase_value,
            speculative: false,
        })
    }
}

fn trace_response(message: &Value) {
    debug!("pool response: {message}");
}

fn hex_field(value: &Value, name: &str) -> Result<Vec<u8>, PoolError> {
    let s = value
        .as_str()
        .ok_or_else(|| PoolError::Protocol(format!("{name} is not a string")))?;
    hex::decode(s).map_err(|e| PoolError::Protocol(format!("{name} is not hex: {e}")))
}

fn u32_hex_field(value: &Value, name: &str) -> Result<u32, PoolError> {
    let s = value
        .as_str()
        .ok_or_else(|| PoolError::Protocol(format!("{name} is not a string")))?;
    u32::from_str_radix(s, 16).map_err(|_| PoolError::Protocol(format!("{name} is not hex")))
}

/// Pull the BIP34 height push out of a coinbase prefix. The scriptsig starts
/// at byte 42; its first element is a 1-4 byte little-endian height push.
fn parse_bip34_height(coinb1: &[u8]) -> Option<u32> {
    let push_len = *coinb1.get(42)? as usize;
    if push_len == 0 || push_len > 4 || coinb1.len() < 43 + push_len {
        return None;
    }
    let mut height = 0u32;
    for (i, &byte) in coinb1[43..43 + push_len].iter().enumerate() {
        height |= (byte as u32) << (8 * i);
    }
    Some(height)
}
