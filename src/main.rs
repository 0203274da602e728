// echotrap - out-of-band request capture service
//
// Main entry point. The binary wires the shared store to the three serving
// components and manages their lifecycle:
// - authoritative DNS resolver on UDP/TCP for `*.<root-domain>`
// - HTTP engine: dashboard REST surface, WebSocket fan-out and the
//   subdomain catch-all on the public port
// - certificate-renewal singleton job behind the store's advisory lock
//
// Shutdown is signal-driven: Ctrl-C / SIGTERM cancels every accept loop and
// flushes the store before exit.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use echotrap_api::HttpGateway;
use echotrap_core::geo::GeoTable;
use echotrap_core::EchotrapConfig;
use echotrap_dns::DnsAuthority;
use echotrap_store::{SessionStore, Store};

mod renewer;

/// Cadence of the store's TTL sweeper.
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Structured JSON logging with environment-based filtering
    // (RUST_LOG=debug,echotrap=trace).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("echotrap=info".parse()?),
        )
        .json()
        .init();

    info!("starting echotrap capture service");

    let config = Arc::new(EchotrapConfig::load()?);
    info!(
        domain = %config.server_domain,
        http_port = config.http_port,
        dns_port = config.dns_port,
        "configuration loaded"
    );

    let store = Store::open(&config.data_dir)?;
    store.spawn_sweeper(SWEEP_PERIOD);

    let geo = Arc::new(match &config.geoip_path {
        Some(path) => GeoTable::load(path).unwrap_or_else(|err| {
            warn!(%err, "geoip table unavailable; captures will carry no country");
            GeoTable::empty()
        }),
        None => GeoTable::empty(),
    });

    let shutdown = CancellationToken::new();

    // Each component gets its own store handle; none is shared across
    // concurrent callers.
    let dns = Arc::new(DnsAuthority::new(
        config.clone(),
        SessionStore::new(store.handle(), config.clone()),
        geo.clone(),
    ));
    let dns_task = tokio::spawn(dns.serve(shutdown.clone()));

    let gateway = HttpGateway::new(
        config.clone(),
        SessionStore::new(store.handle(), config.clone()),
        geo.clone(),
        shutdown.clone(),
    );
    let http_task = tokio::spawn(async move { gateway.serve().await });

    let renewer_task = tokio::spawn(renewer::run(
        SessionStore::new(store.handle(), config.clone()),
        shutdown.clone(),
    ));

    match signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping echotrap"),
        Err(err) => error!(%err, "unable to listen for shutdown signal"),
    }
    shutdown.cancel();

    for (name, task) in [("dns", dns_task), ("http", http_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(component = name, %err, "component failed"),
            Err(err) => error!(component = name, %err, "component task panicked"),
        }
    }
    if let Err(err) = renewer_task.await {
        error!(%err, "renewer task panicked");
    }

    if let Err(err) = store.flush().await {
        warn!(%err, "final store flush failed");
    }

    info!("echotrap stopped");
    Ok(())
}
