//! Coordinator Wiring
//!
//! Builds the full pipeline from settings and runs the event loop:
//! sources feed the failover manager, accepted tips rebuild templates and
//! rebroadcast jobs, found blocks go back out through the shared-memory
//! return channel and the aux submission paths.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use quaxis_core::{CoinbaseBuilder, CoinbaseError, SourceKind, TipEvent};
use quaxis_mining::{
    ExtranonceAllocator, FoundBlock, JobManager, MergedMiner, ShareValidator, TemplateCache,
    TipOutcome,
};
use quaxis_network::{AsicServer, ServerConfig, ServerError};
use quaxis_relay::{ReconstructorConfig, RelayListener, RelayListenerConfig, RelayStats};
use quaxis_sources::{
    BlockSubmitter, FallbackConfig, FallbackManager, PoolClient, PoolClientConfig, ShmSubscriber,
    TipRegionReader, WaiterConfig,
};

use crate::settings::{aux_chain_work, Settings, SettingsError};
use crate::telemetry;

/// Coordinator startup and runtime errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration problem (exit code 1)
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// Payout/tag rejected by the coinbase builder (exit code 1)
    #[error("Coinbase configuration error: {0}")]
    Coinbase(#[from] CoinbaseError),

    /// A component failed to start (exit code 2)
    #[error("Initialization failed: {0}")]
    Init(String),
}

impl From<ServerError> for NodeError {
    fn from(e: ServerError) -> Self {
        NodeError::Init(e.to_string())
    }
}

/// Build everything and run until shutdown.
pub async fn run(settings: Settings, mut shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
    // Mining pipeline
    let payout = settings.payout_pubkey_hash()?;
    let coinbase_builder = CoinbaseBuilder::new(payout, settings.mining.coinbase_tag.as_bytes())?;
    let cache = Arc::new(TemplateCache::new(coinbase_builder));
    let allocator = Arc::new(ExtranonceAllocator::new(1));
    let jobs = Arc::new(JobManager::new(
        cache.clone(),
        allocator,
        Duration::from_secs(settings.mining.stale_ttl_secs),
    ));
    let validator = Arc::new(ShareValidator::new(
        jobs.clone(),
        settings.mining.partial_difficulty,
    ));

    // Merged mining
    let merged = Arc::new(MergedMiner::new());
    if !settings.aux.is_empty() {
        let chains = settings
            .aux
            .iter()
            .map(aux_chain_work)
            .collect::<Result<Vec<_>, _>>()?;
        merged
            .set_aux_work(chains)
            .map_err(|e| NodeError::Init(e.to_string()))?;
        info!("merged mining active on {} aux chains", merged.active_chains());
    }

    // Found blocks flow from whichever thread validates the winning share.
    let (found_tx, mut found_rx) = mpsc::unbounded_channel::<FoundBlock>();
    validator.set_found_block_callback(Box::new(move |block| {
        let _ = found_tx.send(block.clone());
    }));

    // ASIC server
    let server = AsicServer::new(
        ServerConfig {
            bind: settings.server.bind.clone(),
            max_connections: settings.server.max_connections,
            heartbeat_interval: Duration::from_secs(settings.server.heartbeat_secs),
            max_missed_heartbeats: settings.server.max_missed_heartbeats,
            control_queue_bound: settings.server.control_queue_bound,
        },
        jobs.clone(),
        validator.clone(),
    );
    let server_addr = server.start(shutdown.clone()).await?;
    info!("accepting ASICs on {server_addr}");

    // Tip sources, priority order: shared memory, relay, pool.
    let (tip_tx, mut tip_rx) = mpsc::channel::<(SourceKind, TipEvent)>(64);

    let shm_stop = Arc::new(AtomicBool::new(false));
    let mut shm_thread = None;
    let mut submitter = None;
    let shm_available = if settings.shm.enabled {
        match TipRegionReader::open(
            std::path::Path::new(&settings.shm.tip_path),
            WaiterConfig {
                spin_iterations: settings.shm.spin_iterations,
                yield_iterations: settings.shm.yield_iterations,
                sleep: Duration::from_micros(settings.shm.sleep_us),
            },
        ) {
            Ok(reader) => {
                let (shm_tx, shm_rx) = mpsc::channel(16);
                let subscriber = ShmSubscriber::new(reader, Duration::from_millis(250));
                shm_thread = Some(subscriber.spawn(shm_tx, shm_stop.clone()));
                spawn_forwarder(SourceKind::SharedMemory, shm_rx, tip_tx.clone());

                match BlockSubmitter::create(std::path::Path::new(&settings.shm.submit_path)) {
                    Ok(s) => submitter = Some(s),
                    Err(e) => warn!("found-block return channel unavailable: {e}"),
                }
                true
            }
            Err(e) => {
                warn!("shared-memory source unavailable: {e}");
                false
            }
        }
    } else {
        false
    };

    if settings.relay.enabled {
        let (relay_tx, relay_rx) = mpsc::channel(16);
        let listener = RelayListener::new(
            RelayListenerConfig {
                bind: settings.relay.bind.clone(),
                default_coinbase_value: settings.relay.default_coinbase_value,
                recv_timeout: Duration::from_millis(250),
                reconstructor: ReconstructorConfig {
                    ttl: Duration::from_secs(settings.relay.reconstruction_ttl_secs),
                    max_concurrent: settings.relay.max_reconstructions,
                },
            },
            Arc::new(RelayStats::default()),
        );
        let relay_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run(relay_tx, relay_shutdown).await {
                error!("relay listener failed: {e}");
            }
        });
        spawn_forwarder(SourceKind::Relay, relay_rx, tip_tx.clone());
    }

    if settings.pool.enabled {
        let (pool_tx, pool_rx) = mpsc::channel(16);
        let client = PoolClient::new(PoolClientConfig {
            endpoint: settings.pool.endpoint.clone(),
            username: settings.pool.username.clone(),
            password: settings.pool.password.clone(),
            default_coinbase_value: settings.pool.default_coinbase_value,
            ..PoolClientConfig::default()
        });
        let pool_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = client.run(pool_tx, pool_shutdown).await {
                error!("pool client stopped: {e}");
            }
        });
        spawn_forwarder(SourceKind::Pool, pool_rx, tip_tx.clone());
    }
    drop(tip_tx);

    let mut fallback = FallbackManager::new(
        FallbackConfig {
            heartbeat_misses: settings.fallback.heartbeat_misses,
            failback_after: Duration::from_secs(settings.fallback.failback_secs),
            ..FallbackConfig::default()
        },
        vec![
            (SourceKind::SharedMemory, shm_available),
            (SourceKind::Relay, settings.relay.enabled),
            (SourceKind::Pool, settings.pool.enabled),
        ],
    );

    let mut heartbeat = tokio::time::interval(Duration::from_secs(settings.fallback.heartbeat_secs));
    let mut prune = tokio::time::interval(Duration::from_secs(60));
    let mut report = tokio::time::interval(Duration::from_secs(30));
    let retention = Duration::from_secs(settings.mining.job_retention_secs);

    info!("coordinator running, waiting for a chain tip");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = tip_rx.recv() => {
                let (kind, tip) = match received {
                    Some(pair) => pair,
                    None => {
                        warn!("all tip source channels closed");
                        break;
                    }
                };
                if !fallback.on_event(kind, &tip) {
                    continue;
                }

                let commitment = merged.current_commitment();
                match cache.on_tip(&tip, commitment.as_ref()) {
                    Ok(TipOutcome::Built) | Ok(TipOutcome::Promoted) => {
                        server.broadcast_jobs();
                    }
                    Ok(TipOutcome::Speculative) => {
                        debug!("speculative template staged for height {}", tip.height);
                    }
                    Ok(TipOutcome::Unchanged) => {}
                    Err(e) => warn!("tip from {kind} rejected: {e}"),
                }
            }
            found = found_rx.recv() => {
                let block = match found {
                    Some(block) => block,
                    None => break,
                };
                dispatch_found_block(&block, submitter.as_mut(), &merged);

                // Our own block is the best guess for the next prev hash.
                let commitment = merged.current_commitment();
                if let Err(e) = cache.precompute_next(block.hash, commitment.as_ref()) {
                    debug!("next-height precompute skipped: {e}");
                }
            }
            _ = heartbeat.tick() => {
                fallback.tick();
                if fallback.all_sources_down() {
                    // Devices keep searching their last range; nothing new
                    // can be broadcast until a source recovers.
                    warn!("no chain-tip source available");
                }
            }
            _ = prune.tick() => {
                jobs.prune(retention);
            }
            _ = report.tick() => {
                telemetry::report_from(&cache, &server, &validator, &fallback);
            }
        }
    }

    // Graceful shutdown: stop the subscriber thread, then let the server's
    // send loops deliver their final stop frames.
    info!("shutting down");
    shm_stop.store(true, Ordering::Relaxed);
    if let Some(handle) = shm_thread {
        let _ = tokio::task::spawn_blocking(move || handle.join()).await;
    }
    telemetry::report_from(&cache, &server, &validator, &fallback);
    Ok(())
}

fn spawn_forwarder(
    kind: SourceKind,
    mut rx: mpsc::Receiver<TipEvent>,
    tx: mpsc::Sender<(SourceKind, TipEvent)>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if tx.send((kind, event)).await.is_err() {
                break;
            }
        }
    });
}

fn dispatch_found_block(
    block: &FoundBlock,
    submitter: Option<&mut BlockSubmitter>,
    merged: &MergedMiner,
) {
    info!(
        "dispatching block at height {}: {} ({} byte coinbase)",
        block.height,
        block.hash,
        block.coinbase.len()
    );

    match submitter {
        Some(submitter) => {
            if let Err(e) = submitter.submit(&block.header, &block.coinbase) {
                error!("block submission through shared memory failed: {e}");
            }
        }
        None => warn!("no return channel configured; block logged only"),
    }

    // Aux chains whose target the hash meets each get a proof.
    for submission in merged.assemble_submissions(&block.header, &block.coinbase, &block.hash) {
        info!(
            "aux-PoW proof dispatched to chain {} ({} branch nodes)",
            submission.chain.chain_id,
            submission.proof.aux_branch.hashes.len()
        );
    }
}
