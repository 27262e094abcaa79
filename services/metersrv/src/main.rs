//! Meter Acquisition Service (metersrv)
//!
//! Runs one acquisition pipeline per configured device until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use metersrv::config::DEFAULT_CONFIG_PATH;
use metersrv::{
    logging, ConnectionManager, Coordinator, LiveFeed, MeterSrvConfig, ModbusConnector,
    SinkRouter, SqliteConnector, StorageManager, SERVICE_NAME, SERVICE_VERSION,
};

/// Command-line arguments for metersrv
#[derive(Parser, Debug)]
#[command(
    name = "metersrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Meter Acquisition Service",
    long_about = None
)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "METERSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level or filter directive; overrides RUST_LOG and the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = MeterSrvConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    let _log_guard = logging::init(&config.logging, args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    info!("Starting {} v{}", SERVICE_NAME, SERVICE_VERSION);
    if !args.config.exists() {
        warn!(
            "Configuration file {} not found, using defaults and environment only",
            args.config.display()
        );
    }

    config.validate().context("Invalid configuration")?;
    if args.validate {
        info!(
            "Validation completed successfully ({} devices, {} profiles)",
            config.devices.len(),
            config.profiles.len()
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();

    let storage = Arc::new(StorageManager::new(
        SqliteConnector::new(&config.storage.path, config.storage.max_connections),
        config.storage.reconnect_policy(),
        cancel.clone(),
    ));
    storage.ensure_ready();

    let mut tasks = Vec::with_capacity(config.devices.len() * 2);
    for device in &config.devices {
        let endpoint = device.endpoint();
        let layout = config.layout_for(device)?;

        let transport = ConnectionManager::new(
            ModbusConnector::new(
                Arc::clone(&endpoint),
                device.connect_timeout(),
                device.response_timeout(),
            ),
            device.reconnect_policy(),
            cancel.clone(),
        );
        transport.ensure_ready();

        let router = SinkRouter::new(Arc::clone(&storage), device.persist_interval());
        tasks.push(tokio::spawn(log_live_feed(router.subscribe())));

        let coordinator = Coordinator::new(
            endpoint,
            layout,
            transport,
            router,
            device.poll_interval(),
            device.max_chunk,
        );
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { coordinator.run(cancel).await }));
    }

    info!(
        "{} running with {} device(s), archive at {}",
        SERVICE_NAME,
        config.devices.len(),
        storage.connector().path().display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    if let Some(pool) = storage.disconnect() {
        pool.close().await;
    }
    info!("{} stopped", SERVICE_NAME);
    Ok(())
}

/// Log every live snapshot until the router goes away
async fn log_live_feed(mut feed: LiveFeed) {
    while let Some(snapshot) = feed.recv().await {
        let readings = snapshot
            .values
            .iter()
            .map(|(name, v)| format!("{}={:.3}{}", name, v.value, v.unit))
            .collect::<Vec<_>>()
            .join(" ");
        info!("{} live: {}", snapshot.device, readings);
    }
    debug!("Live feed closed");
}
