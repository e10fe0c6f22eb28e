//! Coordinator Configuration
//!
//! TOML settings loaded through the `config` crate. Every section has
//! defaults, so a minimal file only needs the payout identity; `--test-config`
//! runs `validate` and exits.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Settings errors
#[derive(Debug, Error)]
pub enum SettingsError {
    /// File missing, unreadable, or not valid TOML
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    /// A field failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Mining parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiningSettings {
    /// Payout identity: 20-byte P2WPKH pubkey hash, hex
    pub payout_pubkey_hash: String,

    /// ASCII tag embedded in the coinbase scriptsig
    pub coinbase_tag: String,

    /// Jobs older than this are stale
    pub stale_ttl_secs: u64,

    /// How long job records are kept for late-share classification
    pub job_retention_secs: u64,

    /// Partial-share difficulty threshold; 0 disables partial accounting
    pub partial_difficulty: f64,
}

impl Default for MiningSettings {
    fn default() -> Self {
        MiningSettings {
            payout_pubkey_hash: String::new(),
            coinbase_tag: "quaxis".to_string(),
            stale_ttl_secs: 120,
            job_retention_secs: 600,
            partial_difficulty: 0.0,
        }
    }
}

/// ASIC server parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// TCP bind address for devices
    pub bind: String,

    /// Connection cap
    pub max_connections: usize,

    /// Heartbeat interval, seconds
    pub heartbeat_secs: u64,

    /// Missed heartbeat replies before disconnect
    pub max_missed_heartbeats: u32,

    /// Per-connection control queue bound
    pub control_queue_bound: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: "0.0.0.0:9833".to_string(),
            max_connections: 128,
            heartbeat_secs: 15,
            max_missed_heartbeats: 3,
            control_queue_bound: 64,
        }
    }
}

/// Shared-memory source parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShmSettings {
    /// Whether the shared-memory source is configured
    pub enabled: bool,

    /// Tip region file
    pub tip_path: String,

    /// Found-block return region file
    pub submit_path: String,

    /// Adaptive waiter phase 1 iterations
    pub spin_iterations: u32,

    /// Adaptive waiter phase 2 iterations
    pub yield_iterations: u32,

    /// Adaptive waiter phase 3 sleep, microseconds
    pub sleep_us: u64,
}

impl Default for ShmSettings {
    fn default() -> Self {
        ShmSettings {
            enabled: false,
            tip_path: "/dev/shm/quaxis-tips".to_string(),
            submit_path: "/dev/shm/quaxis-submit".to_string(),
            spin_iterations: 10_000,
            yield_iterations: 1_000,
            sleep_us: 100,
        }
    }
}

/// Relay source parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Whether the UDP relay source is configured
    pub enabled: bool,

    /// UDP bind address
    pub bind: String,

    /// Coinbase value assumed for relay-derived templates, satoshis
    pub default_coinbase_value: i64,

    /// Reconstruction TTL, seconds
    pub reconstruction_ttl_secs: u64,

    /// Concurrent reconstruction cap
    pub max_reconstructions: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings {
            enabled: false,
            bind: "0.0.0.0:8336".to_string(),
            default_coinbase_value: 312_500_000,
            reconstruction_ttl_secs: 30,
            max_reconstructions: 8,
        }
    }
}

/// Pool fallback parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Whether the pool fallback is configured
    pub enabled: bool,

    /// host:port of the pool
    pub endpoint: String,

    /// Worker username
    pub username: String,

    /// Worker password
    pub password: String,

    /// Coinbase value assumed for pool-derived templates, satoshis
    pub default_coinbase_value: i64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            enabled: false,
            endpoint: "127.0.0.1:3333".to_string(),
            username: "quaxis".to_string(),
            password: "x".to_string(),
            default_coinbase_value: 312_500_000,
        }
    }
}

/// Failover parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    /// Heartbeat tick interval, seconds
    pub heartbeat_secs: u64,

    /// Consecutive missed ticks before demotion
    pub heartbeat_misses: u32,

    /// Sustained health required before failback, seconds
    pub failback_secs: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        FallbackSettings {
            heartbeat_secs: 10,
            heartbeat_misses: 3,
            failback_secs: 60,
        }
    }
}

/// One configured auxiliary chain.
#[derive(Debug, Clone, Deserialize)]
pub struct AuxChainSettings {
    /// Chain identifier (fixes the Merkle slot)
    pub chain_id: u32,

    /// Current aux block hash to commit to, hex
    pub block_hash: String,

    /// Aux target, hex
    pub target: String,
}

/// Top-level settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Mining parameters
    pub mining: MiningSettings,

    /// ASIC server
    pub server: ServerSettings,

    /// Shared-memory source
    pub shm: ShmSettings,

    /// Relay source
    pub relay: RelaySettings,

    /// Pool fallback
    pub pool: PoolSettings,

    /// Failover behavior
    pub fallback: FallbackSettings,

    /// Auxiliary chains for merged mining
    pub aux: Vec<AuxChainSettings>,
}

impl Settings {
    /// Load from an explicit file, or defaults plus `quaxis.toml` if present.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("quaxis").required(false)),
        };
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Check field consistency. Called before any component starts.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.payout_pubkey_hash()?;

        if self.mining.coinbase_tag.len() > 16 {
            return Err(SettingsError::Invalid(format!(
                "coinbase_tag is {} bytes, maximum is 16",
                self.mining.coinbase_tag.len()
            )));
        }
        if !self.shm.enabled && !self.relay.enabled && !self.pool.enabled {
            return Err(SettingsError::Invalid(
                "no tip source enabled; enable shm, relay or pool".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::Invalid("max_connections must be > 0".to_string()));
        }
        for chain in &self.aux {
            hex32(&chain.block_hash)
                .map_err(|e| SettingsError::Invalid(format!("aux chain {}: {e}", chain.chain_id)))?;
            hex32(&chain.target)
                .map_err(|e| SettingsError::Invalid(format!("aux chain {}: {e}", chain.chain_id)))?;
        }
        Ok(())
    }

    /// Decode the payout identity.
    pub fn payout_pubkey_hash(&self) -> Result<[u8; 20], SettingsError> {
        let decoded = hex::decode(&self.mining.payout_pubkey_hash).map_err(|_| {
            SettingsError::Invalid("payout_pubkey_hash is not valid hex".to_string())
        })?;
        if decoded.len() != 20 {
            return Err(SettingsError::Invalid(format!(
                "payout_pubkey_hash is {} bytes, need 20",
                decoded.len()
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&decoded);
        Ok(out)
    }
}

fn hex32(s: &str) -> Result<[u8; 32], String> {
    let decoded = hex::decode(s).map_err(|_| "not valid hex".to_string())?;
    if decoded.len() != 32 {
        return Err(format!("{} bytes, need 32", decoded.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&decoded);
    Ok(out)
}

/// Parse an aux chain's hex fields into work the merged miner accepts.
pub fn aux_chain_work(
    settings: &AuxChainSettings,
) -> Result<quaxis_mining::AuxChainWork, SettingsError> {
    let block_hash = hex32(&settings.block_hash)
        .map_err(|e| SettingsError::Invalid(format!("aux chain {}: {e}", settings.chain_id)))?;
    let target = hex32(&settings.target)
        .map_err(|e| SettingsError::Invalid(format!("aux chain {}: {e}", settings.chain_id)))?;
    Ok(quaxis_mining::AuxChainWork {
        chain_id: settings.chain_id,
        block_hash: quaxis_core::Hash256(block_hash),
        target: quaxis_core::Hash256(target),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        let mut settings = Settings::default();
        settings.mining.payout_pubkey_hash = "11".repeat(20);
        settings.shm.enabled = true;
        settings
    }

    #[test]
    fn test_valid_settings_pass() {
        assert!(valid().validate().is_ok());
        assert_eq!(valid().payout_pubkey_hash().unwrap(), [0x11; 20]);
    }

    #[test]
    fn test_rejects_bad_payout() {
        let mut settings = valid();
        settings.mining.payout_pubkey_hash = "zz".to_string();
        assert!(settings.validate().is_err());

        settings.mining.payout_pubkey_hash = "11".repeat(19);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_no_sources() {
        let mut settings = valid();
        settings.shm.enabled = false;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_tag() {
        let mut settings = valid();
        settings.mining.coinbase_tag = "x".repeat(17);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_aux_chain_parsing() {
        let chain = AuxChainSettings {
            chain_id: 7,
            block_hash: "ab".repeat(32),
            target: "00".repeat(31) + "7f",
        };
        let work = aux_chain_work(&chain).unwrap();
        assert_eq!(work.chain_id, 7);
        assert_eq!(work.block_hash.0[0], 0xab);
        assert_eq!(work.target.0[31], 0x7f);
    }
}
