// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for fleetward.
//!
//! [`FleetRuntime`] starts the queue processor, the fleet manager and both
//! reconciliation daemons inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleetward_manager::runtime::FleetRuntime;
//! use fleetward_manager::{MemoryStore, SimulatedProtocol};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = FleetRuntime::builder()
//!         .store(Arc::new(MemoryStore::new()))
//!         .protocol(Arc::new(SimulatedProtocol::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let manager = runtime.manager().clone();
//!     // ... create managed sets, add devices ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use fleetward_core::{MacroProgressContainer, QueueProcessor, QueueProcessorConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::daemons::{
    DomainSyncReconciler, HeartbeatReconciler, ReconcileConfig, ReconciliationDaemon,
};
use crate::manager::{FleetManager, ManagerSettings};
use crate::protocol::DeviceProtocol;
use crate::store::Store;

/// Builder for configuring and starting a [`FleetRuntime`].
#[derive(Default)]
pub struct FleetRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    protocol: Option<Arc<dyn DeviceProtocol>>,
    settings: ManagerSettings,
    heartbeat: ReconcileConfig,
    domain_sync: Option<ReconcileConfig>,
}

impl FleetRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the durable store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the device protocol (required).
    pub fn protocol(mut self, protocol: Arc<dyn DeviceProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set the manager tunables.
    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the heartbeat daemon configuration.
    pub fn heartbeat(mut self, config: ReconcileConfig) -> Self {
        self.heartbeat = config;
        self
    }

    /// Set the domain-sync daemon configuration.
    pub fn domain_sync(mut self, config: ReconcileConfig) -> Self {
        self.domain_sync = Some(config);
        self
    }

    /// Apply manager settings and daemon configs from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.settings(ManagerSettings::from_config(config))
            .heartbeat(config.heartbeat.clone())
            .domain_sync(config.domain_sync.clone())
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FleetRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let protocol = self
            .protocol
            .ok_or_else(|| anyhow::anyhow!("protocol is required"))?;
        if self.settings.max_versions_to_store == 0 {
            return Err(anyhow::anyhow!("max_versions_to_store must be positive"));
        }

        Ok(FleetRuntimeConfig {
            store,
            protocol,
            settings: self.settings,
            heartbeat: self.heartbeat,
            domain_sync: self.domain_sync.unwrap_or_else(ReconcileConfig::domain_sync),
        })
    }
}

/// Configuration for a [`FleetRuntime`].
pub struct FleetRuntimeConfig {
    store: Arc<dyn Store>,
    protocol: Arc<dyn DeviceProtocol>,
    settings: ManagerSettings,
    heartbeat: ReconcileConfig,
    domain_sync: ReconcileConfig,
}

impl FleetRuntimeConfig {
    /// Start the runtime: create the processor and manager, load the fleet
    /// and spawn both daemons.
    pub async fn start(self) -> Result<FleetRuntime> {
        let processor = QueueProcessor::new(QueueProcessorConfig {
            default_capacity: self.settings.queue_capacity,
        });

        let manager =
            FleetManager::new(self.store, self.protocol, processor, self.settings).await?;

        let startup = manager.load_all().await?;

        let heartbeat = Arc::new(ReconciliationDaemon::new(
            HeartbeatReconciler::new(manager.clone()),
            self.heartbeat,
        ));
        let heartbeat_shutdown = heartbeat.shutdown_handle();
        let heartbeat_daemon = heartbeat.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat_daemon.run().await;
        });

        let domain_sync = Arc::new(ReconciliationDaemon::new(
            DomainSyncReconciler::new(manager.clone()),
            self.domain_sync,
        ));
        let domain_sync_shutdown = domain_sync.shutdown_handle();
        let domain_sync_daemon = domain_sync.clone();
        let domain_sync_handle = tokio::spawn(async move {
            domain_sync_daemon.run().await;
        });

        info!(
            resubscribing = startup.child_count(),
            "FleetRuntime started"
        );

        Ok(FleetRuntime {
            manager,
            startup,
            heartbeat,
            domain_sync,
            heartbeat_handle,
            domain_sync_handle,
            heartbeat_shutdown,
            domain_sync_shutdown,
        })
    }
}

/// A running fleetward instance.
///
/// The runtime manages:
/// - the queue processor and its work area workers (owned by the manager)
/// - the heartbeat daemon
/// - the domain-sync daemon
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FleetRuntime {
    manager: Arc<FleetManager>,
    startup: Arc<MacroProgressContainer>,
    heartbeat: Arc<ReconciliationDaemon<HeartbeatReconciler>>,
    domain_sync: Arc<ReconciliationDaemon<DomainSyncReconciler>>,
    heartbeat_handle: JoinHandle<()>,
    domain_sync_handle: JoinHandle<()>,
    heartbeat_shutdown: Arc<Notify>,
    domain_sync_shutdown: Arc<Notify>,
}

impl FleetRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::new()
    }

    /// The fleet manager.
    pub fn manager(&self) -> &Arc<FleetManager> {
        &self.manager
    }

    /// Progress of the startup resubscription.
    pub fn startup(&self) -> &Arc<MacroProgressContainer> {
        &self.startup
    }

    /// The heartbeat daemon, for inspecting and resetting suspended devices.
    pub fn heartbeat(&self) -> &Arc<ReconciliationDaemon<HeartbeatReconciler>> {
        &self.heartbeat
    }

    /// The domain-sync daemon.
    pub fn domain_sync(&self) -> &Arc<ReconciliationDaemon<DomainSyncReconciler>> {
        &self.domain_sync
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops both daemons, then shuts the manager down: no new tasks are
    /// accepted, every subscribed device is unsubscribed and the work areas
    /// are drained.
    pub async fn shutdown(self) -> Result<()> {
        info!("FleetRuntime shutting down...");

        self.heartbeat_shutdown.notify_one();
        self.domain_sync_shutdown.notify_one();

        if let Err(e) = self.heartbeat_handle.await {
            error!("Heartbeat daemon task panicked: {}", e);
        }
        if let Err(e) = self.domain_sync_handle.await {
            error!("Domain-sync daemon task panicked: {}", e);
        }

        self.manager.shutdown().await;

        info!("FleetRuntime shutdown complete");
        Ok(())
    }

    /// Check if the daemons are still running.
    ///
    /// A disabled daemon returns immediately and is not counted.
    pub fn is_running(&self) -> bool {
        let alive = |enabled: bool, handle: &JoinHandle<()>| !enabled || !handle.is_finished();
        self.manager.processor().is_accepting()
            && alive(self.heartbeat.is_enabled(), &self.heartbeat_handle)
            && alive(self.domain_sync.is_enabled(), &self.domain_sync_handle)
    }
}
