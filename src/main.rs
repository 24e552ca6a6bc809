use anyhow::Context;
use embassy_executor::Spawner;
use embassy_time::{Duration, Ticker};
use log::{error, info, warn};
use scale_link::system::logging;
use scale_link::server::{FrameFormat, TelemetryServer, TransferServer};
use scale_link::transfer::{MemoryTransferLog, SystemClock};
use scale_link::{
    console, BroadcastHub, CommandDispatcher, Config, ScaleState, StateManager, TransferApi,
    TransferRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    logging::init();

    info!("Starting scale-link");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:?}", e);
            std::process::exit(1);
        }
    };

    let state = StateManager::new(ScaleState::new(config.initial_battery, config.unit));
    let dispatcher = CommandDispatcher::new(state.clone());
    let hub = Arc::new(BroadcastHub::new(
        state.clone(),
        Duration::from_millis(config.broadcast_period_ms),
    ));
    let registry = Arc::new(
        TransferRegistry::new(config.transfer_ttl_secs)
            .with_clock(Arc::new(SystemClock))
            .with_log(Arc::new(MemoryTransferLog::new())),
    );

    if let Err(e) = start_servers(&config, &hub, &dispatcher, &registry) {
        error!("Failed to start servers: {:?}", e);
        std::process::exit(1);
    }

    hub.start();
    if spawner.spawn(broadcast_task(Arc::clone(&hub))).is_err() {
        error!("Failed to spawn broadcast task");
        std::process::exit(1);
    }

    // Expiry is checked on every verify; the purge only reclaims memory
    if spawner
        .spawn(purge_task(
            Arc::clone(&registry),
            Duration::from_secs(config.purge_interval_secs),
        ))
        .is_err()
    {
        warn!("Failed to spawn purge task - lapsed codes will not be reclaimed");
    }

    let console_hub = Arc::clone(&hub);
    let spawned = std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            if let Err(e) = console::run(&dispatcher, stdin.lock(), std::io::stdout()) {
                error!("Console failed: {}", e);
            }
            console_hub.stop();
            info!("Shutting down");
            std::process::exit(0);
        });
    if let Err(e) = spawned {
        warn!("Console unavailable: {}", e);
    }
}

fn start_servers(
    config: &Config,
    hub: &Arc<BroadcastHub>,
    dispatcher: &CommandDispatcher,
    registry: &Arc<TransferRegistry>,
) -> anyhow::Result<()> {
    TelemetryServer::bind(
        config.telemetry_addr.as_str(),
        Arc::clone(hub),
        dispatcher.clone(),
        FrameFormat::Json,
    )
    .and_then(TelemetryServer::spawn)
    .with_context(|| format!("Telemetry server on {}", config.telemetry_addr))?;

    if let Some(addr) = &config.binary_addr {
        TelemetryServer::bind(addr.as_str(), Arc::clone(hub), dispatcher.clone(), FrameFormat::Binary)
            .and_then(TelemetryServer::spawn)
            .with_context(|| format!("Binary stream server on {}", addr))?;
    }

    TransferServer::bind(
        config.transfer_addr.as_str(),
        TransferApi::new(Arc::clone(registry)),
    )
    .and_then(TransferServer::spawn)
    .with_context(|| format!("Transfer server on {}", config.transfer_addr))?;

    Ok(())
}

#[embassy_executor::task]
async fn broadcast_task(hub: Arc<BroadcastHub>) {
    info!("Broadcast task started");
    hub.run().await;
}

#[embassy_executor::task]
async fn purge_task(registry: Arc<TransferRegistry>, interval: Duration) {
    let mut ticker = Ticker::every(interval);
    loop {
        ticker.next().await;
        let purged = registry.purge_expired().await;
        if purged > 0 {
            info!("Purged {} lapsed transfer codes", purged);
        }
    }
}
