use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bondd::Config;
use bondd::Confirmation;
use bondd::ConfirmationGateway;
use bondd::Manager;
use bondd::ManagerOptions;
use bondd::RosterChange;
use bondd::Transport;
use bondd::config::ConfirmationConfig;
use bondd::config::ConfirmationMode;
use bondd::gateway::ConsoleGateway;
use bondd::gateway::PolicyGateway;
use bondd::gateway::SerialGateway;
use bondd::gateway::TimeoutGateway;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Bluetooth pairing daemon
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "bondd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.logging.directives()))
        .init();

    tracing::info!("bondd starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let transport = open_transport(&config).await?;
    let gateway = build_gateway(&config.confirmation);
    let manager = Arc::new(Manager::new(
        transport,
        gateway,
        ManagerOptions::from(&config.transport),
    ));

    manager
        .start()
        .await
        .context("Failed to load known devices")?;
    for device in manager.list() {
        tracing::info!(
            "Known device {} ({}), paired={}",
            device.address(),
            device.display_name(),
            device.paired
        );
    }

    tokio::spawn(log_roster_changes(manager.clone(), manager.subscribe()));

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_handle = config.api.as_ref().map(|api| {
        let listen = api.listen.clone();
        let port = api.port;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = bondd::api::serve(&listen, port, manager, api_shutdown_rx).await {
                tracing::error!("HTTP API server failed: {}", e);
            }
        })
    });

    tracing::info!("Listening for device changes, press Ctrl+C to exit");

    let result = tokio::select! {
        result = manager.run() => result.context("Device change processing stopped"),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("Received shutdown signal"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
            Ok(())
        }
    };

    manager.shutdown();
    if let Some(handle) = api_handle {
        let _ = api_shutdown_tx.send(());
        let _ = handle.await;
    }

    tracing::info!("bondd shutdown complete");
    result
}

#[cfg(feature = "bluez")]
async fn open_transport(config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    let transport = bondd::bluez::BluezTransport::new(config.transport.adapter.as_deref())
        .await
        .context("Failed to open Bluetooth adapter")?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "bluez"))]
async fn open_transport(_config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    anyhow::bail!("bondd was built without a transport backend; rebuild with --features bluez")
}

fn build_gateway(cfg: &ConfirmationConfig) -> Arc<dyn ConfirmationGateway> {
    let mut gateway: Box<dyn ConfirmationGateway> = match cfg.mode {
        ConfirmationMode::Console => Box::new(ConsoleGateway::new()),
        ConfirmationMode::Accept => Box::new(PolicyGateway(Confirmation::Yes)),
        ConfirmationMode::Reject => Box::new(PolicyGateway(Confirmation::No)),
    };
    if let Some(secs) = cfg.timeout_secs {
        gateway = Box::new(TimeoutGateway::new(gateway, Duration::from_secs(secs)));
    }
    if cfg.serialize {
        gateway = Box::new(SerialGateway::new(gateway));
    }
    tracing::info!(
        "Pairing confirmation: {:?} (timeout: {:?}, serialized: {})",
        cfg.mode,
        cfg.timeout_secs,
        cfg.serialize
    );
    Arc::from(gateway)
}

async fn log_roster_changes(manager: Arc<Manager>, mut rx: broadcast::Receiver<RosterChange>) {
    loop {
        match rx.recv().await {
            Ok(RosterChange::Reloaded) => {
                tracing::info!("Roster reloaded: {} device(s)", manager.list().len())
            }
            Ok(RosterChange::Upserted(address)) => {
                if let Some(device) = manager.get(address) {
                    tracing::debug!("Roster entry {}: {:?}", address, device);
                }
            }
            Ok(RosterChange::Removed(address)) => {
                tracing::info!("Roster entry {} removed", address)
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Roster observer lagged by {} change(s)", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
