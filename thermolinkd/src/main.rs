mod api;
mod bus;
mod config;
mod link;
mod session;
mod status;
mod store;
mod store_manager;

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::codec::BincodeCodec;
use crate::bus::Bus;
use crate::config::{Config, DeviceConfig};
use crate::link::host::HostRadio;
use crate::link::radio::RadioVersion;
use crate::link::{LinkManager, LinkSettings};
use crate::session::transport::WebSocketTransport;
use crate::session::{CloudSession, SessionSettings};
use crate::status::StatusTracker;
use crate::store::db::SettingsDb;
use crate::store_manager::StoreHandle;

/// Locally administered MAC derived from the hardware id
fn host_mac(device: &DeviceConfig) -> [u8; 6] {
    let low = device.hardware_id[2].to_be_bytes();
    [0x02, 0x00, low[0], low[1], low[2], low[3]]
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("thermolinkd=info"))
        )
        .init();

    tracing::info!("Starting thermolinkd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/thermolink/thermolinkd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);
    tracing::info!("Device id {}", config.device.device_id());

    // Open the settings database and hand it to its thread
    let db = SettingsDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);
    let store = StoreHandle::spawn(db);

    if let Some(seed) = config.network.clone() {
        if store.stored_net_settings().await?.is_none() {
            tracing::info!("Seeding network settings for {}", seed.ssid);
            store.set_net_settings(seed).await?;
        }
    }

    let bus = Bus::new();
    let cancel = CancellationToken::new();
    let mut watchdogs = Vec::new();

    // Status tracker subscribes first so it sees every initial publish
    let (tracker, status_view) = StatusTracker::new();
    let status_mailbox = bus.subscribe("status", status::TOPICS, Duration::from_secs(1));
    let status_handle = tokio::spawn(tracker.run(status_mailbox, cancel.clone()));

    // Cloud session
    let mut session_mailbox =
        bus.subscribe("session", session::TOPICS, config.session.idle_interval());
    if let Some(secs) = config.session.watchdog_secs {
        watchdogs.push(session_mailbox.watch(Duration::from_secs(secs)));
    }
    let cloud = CloudSession::new(
        WebSocketTransport::new(),
        BincodeCodec,
        store.clone(),
        bus.clone(),
        SessionSettings::new(&config.device, &config.session),
    );
    let session_cancel = cancel.clone();
    let session_handle = tokio::spawn(async move {
        if let Err(e) = cloud.run(session_mailbox, session_cancel).await {
            tracing::error!("Cloud session error: {}", e);
        }
    });

    // Link manager
    let mut link_mailbox =
        bus.subscribe("link", link::manager::TOPICS, config.link.idle_interval());
    if let Some(secs) = config.link.watchdog_secs {
        watchdogs.push(link_mailbox.watch(Duration::from_secs(secs)));
    }
    let radio_version: RadioVersion = config
        .link
        .expected_radio_version
        .parse()
        .context("Invalid expected_radio_version")?;
    let radio = HostRadio::new(
        bus.clone(),
        host_mac(&config.device),
        radio_version,
        config.link.ping_target,
    );
    let link_manager = LinkManager::new(
        radio,
        store.clone(),
        bus.clone(),
        LinkSettings::from(&config.link),
    );
    let link_cancel = cancel.clone();
    let link_handle = tokio::spawn(async move {
        if let Err(e) = link_manager.run(link_mailbox, link_cancel).await {
            tracing::error!("Link manager error: {}", e);
        }
    });

    let supervisor_handle = tokio::spawn(bus::supervise(watchdogs, cancel.clone()));

    // Build API router
    let app = api::routes::router(api::routes::AppState {
        store: store.clone(),
        bus: bus.clone(),
        status: status_view,
        sensor_count: config.session.sensor_count,
        output_count: config.session.output_count,
    });

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for ctrl-c, or for the supervisor to give up on a unit
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutdown signal received");
        }
        _ = cancel.cancelled() => {
            tracing::warn!("Supervisor requested shutdown");
        }
    }

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(
        status_handle,
        session_handle,
        link_handle,
        supervisor_handle,
        server_handle
    );

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_mac_is_locally_administered() {
        let device = DeviceConfig {
            hardware_id: [0, 0, 0x0a0b0c0d],
            firmware_version: "1.0.0".to_string(),
        };
        let mac = host_mac(&device);
        assert_eq!(mac, [0x02, 0x00, 0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(mac[0] & 0x02, 0x02);
    }
}
