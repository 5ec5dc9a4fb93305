// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetward - Device Fleet Manager
//!
//! Runs the fleet manager against a SQLite store:
//! - Work area queues (one worker per managed set, plus the manager area)
//! - Heartbeat daemon (subscription and reachability)
//! - Domain-sync daemon (configuration drift)
//!
//! Devices are driven through the simulated protocol.

use std::sync::Arc;
use tracing::{info, warn};

use fleetward_manager::config::Config;
use fleetward_manager::model::DeviceState;
use fleetward_manager::protocol::SimulatedProtocol;
use fleetward_manager::runtime::FleetRuntime;
use fleetward_manager::store::{EntityKind, SqliteStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetward_manager=info,fleetward_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        database_url = %config.database_url,
        heartbeat_enabled = config.heartbeat.enabled,
        domain_sync_enabled = config.domain_sync.enabled,
        "Starting Fleetward"
    );

    // Open database and run migrations
    let store = Arc::new(SqliteStore::open(&config.database_url).await?);
    info!("Database schema verified");

    // Every stored device answers in the simulated fleet
    let protocol = Arc::new(SimulatedProtocol::new());
    for record in store.list(EntityKind::Device).await? {
        let device: DeviceState = serde_json::from_value(record.body)?;
        let level = device.firmware_level.as_deref().unwrap_or("unknown");
        protocol.add_device(&device.address, level).await;
    }

    let runtime = FleetRuntime::builder()
        .store(store)
        .protocol(protocol)
        .config(&config)
        .build()?
        .start()
        .await?;

    let status = runtime.manager().status().await;
    info!(
        devices = status.devices,
        managed_sets = status.managed_sets,
        "Fleet manager ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Fleetward shut down");

    Ok(())
}
