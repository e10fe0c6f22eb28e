//! Quaxis Solo Mining Coordinator - Entry Point
//!
//! Parses the command line, loads and validates the TOML configuration,
//! initializes logging, and runs the coordinator until SIGINT/SIGTERM.
//!
//! Exit codes: 0 on clean shutdown or `--test-config` success, 1 for
//! configuration problems, 2 for initialization failures.

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process;
use tokio::sync::watch;

mod node;
mod settings;
mod telemetry;

use settings::Settings;

/// Solo Bitcoin mining coordinator for Avalon 1126 Pro fleets
#[derive(Parser)]
#[clap(name = "quaxis", version, about)]
struct Cli {
    /// Path to the configuration file (quaxis.toml)
    #[clap(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[clap(long)]
    test_config: bool,

    /// Verbosity level (0-4)
    #[clap(short, long, default_value = "2")]
    verbosity: u8,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };
    if let Err(e) = settings.validate() {
        error!("{e}");
        process::exit(1);
    }

    if cli.test_config {
        info!("configuration is valid");
        return;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            process::exit(2);
        }
    };

    let exit_code = runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // SIGINT/SIGTERM both trigger a graceful drain.
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        error!("cannot install SIGTERM handler: {e}");
                        let _ = ctrl_c.await;
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                info!("received interrupt");
            }
            let _ = shutdown_tx.send(true);
        });

        match node::run(settings, shutdown_rx).await {
            Ok(()) => 0,
            Err(node::NodeError::Init(e)) => {
                error!("initialization failed: {e}");
                2
            }
            Err(e) => {
                error!("{e}");
                1
            }
        }
    });

    process::exit(exit_code);
}
