//! Status Reporting
//!
//! Periodic one-line summaries of the coordinator's health: active source,
//! template height, fleet size and hashrate, share counters. Consumed
//! through the log; scrapers and UIs live outside this repo.

use log::info;
use std::sync::Arc;

use quaxis_mining::{ShareValidator, TemplateCache};
use quaxis_network::AsicServer;
use quaxis_sources::{FallbackManager, SourceStatus};

/// Emit one status line.
pub fn report(
    cache: &TemplateCache,
    server: &Arc<AsicServer>,
    validator: &Arc<ShareValidator>,
    sources: &[SourceStatus],
    active: quaxis_core::SourceKind,
) {
    let height = cache
        .current()
        .map(|(_, t)| t.height.to_string())
        .unwrap_or_else(|| "-".to_string());

    let server_stats = server.stats();
    let shares = validator.stats();

    let source_summary: Vec<String> = sources
        .iter()
        .map(|s| format!("{}:{:?}", s.kind, s.state))
        .collect();

    info!(
        "status: height {height} | source {active} [{}] | {} devices, {} GH/s | \
         shares {} (blocks {}, stale {}, dup {}, reject {})",
        source_summary.join(" "),
        server_stats.active_connections,
        server_stats.fleet_hashrate,
        shares.total,
        shares.blocks_found,
        shares.stale,
        shares.duplicates,
        shares.target_not_met + shares.bad_version + shares.unknown_job,
    );
}

/// Convenience wrapper pulling the source list from the manager.
pub fn report_from(
    cache: &TemplateCache,
    server: &Arc<AsicServer>,
    validator: &Arc<ShareValidator>,
    fallback: &FallbackManager,
) {
    report(
        cache,
        server,
        validator,
        &fallback.statuses(),
        fallback.active_kind(),
    );
}
