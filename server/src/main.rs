//! Standalone headless daemon bridging ArtNet/sACN DMX to LAN-controllable
//! Govee lighting fixtures.
//!
//! Wires the CLI/config layer to [`bridge_core::Supervisor`] and forwards
//! process signals: `SIGINT`/`SIGTERM` request graceful shutdown, `SIGHUP`
//! requests a hot configuration reload (spec §4.S, §6 "Signals").

mod config;

use anyhow::{Context, Result};
use bridge_core::Supervisor;
use clap::Parser;

use crate::config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("govee-artnet-bridged v{}", env!("CARGO_PKG_VERSION"));

    let config = args.load_config().context("failed to load configuration")?;
    log::info!(
        "configuration loaded: db_path={}, artnet={}:{}, sacn={}:{}, dry_run={}",
        config.db_path.display(),
        config.artnet_enabled,
        config.artnet_port,
        config.sacn_enabled,
        config.sacn_port,
        config.dry_run,
    );

    if config.migrate_only {
        // Opening the Store applies migrations as a side effect; bootstrap
        // and immediately shut down without starting any subsystem
        // (spec §6 "migrate_only").
        let supervisor = Supervisor::bootstrap(config).context("failed to apply migrations")?;
        supervisor.shutdown().await;
        log::info!("migrations applied, exiting (migrate_only)");
        return Ok(());
    }

    let supervisor = Supervisor::bootstrap(config).context("failed to bootstrap supervisor")?;
    supervisor.start().await.context("failed to start subsystems")?;
    log::info!("subsystems started");

    run_until_shutdown(&supervisor, args.config.as_deref()).await;

    log::info!("shutting down");
    supervisor.shutdown().await;
    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a terminal signal, applying any number of `SIGHUP` reloads
/// along the way, and returns once `SIGINT`/`SIGTERM` is received.
async fn run_until_shutdown(supervisor: &std::sync::Arc<Supervisor>, config_path: Option<&std::path::Path>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGHUP handler: {e}");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return,
                _ = sigterm.recv() => return,
                _ = sighup.recv() => {
                    log::info!("SIGHUP received, reloading configuration");
                    match supervisor.reload(config_path).await {
                        Ok(()) => log::info!("reload complete"),
                        Err(e) => log::warn!("reload rejected, retaining running configuration: {e}"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
