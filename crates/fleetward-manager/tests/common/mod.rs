// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fleetward-manager integration tests.
//!
//! Provides TestFleet: a manager wired to an in-memory store and a simulated
//! device fleet, with short timeouts.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetward_core::{ProgressContainer, ProgressStatus, QueueProcessor, QueueProcessorConfig};
use fleetward_manager::model::{Entity, EntityState};
use fleetward_manager::{
    Device, FleetManager, ManagerSettings, MemoryStore, SimulatedProtocol, Store,
};

/// Firmware level every simulated device starts on.
pub const INITIAL_LEVEL: &str = "7.0";

/// Manager settings scaled down for tests.
pub fn test_settings() -> ManagerSettings {
    ManagerSettings {
        queue_capacity: None,
        max_versions_to_store: 3,
        quiesce_timeout: Duration::from_secs(2),
        firmware_reboot_timeout: Duration::from_secs(2),
        reboot_poll_interval: Duration::from_millis(10),
    }
}

/// Manager plus the collaborators tests script.
pub struct TestFleet {
    pub manager: Arc<FleetManager>,
    pub store: Arc<MemoryStore>,
    pub sim: Arc<SimulatedProtocol>,
}

impl TestFleet {
    /// Create a fleet with default test settings.
    pub async fn new() -> Self {
        Self::with(SimulatedProtocol::new(), test_settings()).await
    }

    /// Create a fleet around a preconfigured simulator.
    pub async fn with(sim: SimulatedProtocol, settings: ManagerSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let sim = Arc::new(sim);
        let processor = QueueProcessor::new(QueueProcessorConfig {
            default_capacity: settings.queue_capacity,
        });
        let manager = FleetManager::new(store.clone(), sim.clone(), processor, settings)
            .await
            .expect("Failed to create fleet manager");
        Self {
            manager,
            store,
            sim,
        }
    }

    /// Register `address` with the simulator, add it to the manager and wait
    /// for the initial subscription and device info.
    pub async fn device(&self, name: &str, address: &str) -> Arc<Device> {
        self.sim.add_device(address, INITIAL_LEVEL).await;
        let (device, progress) = self
            .manager
            .add_device(name, address, "mx-480", None)
            .await
            .expect("Failed to add device");
        assert_eq!(finish(&progress).await, ProgressStatus::Complete);
        let refreshed = self
            .manager
            .refresh_device_info(device.handle())
            .await
            .expect("Failed to queue refresh");
        assert_eq!(finish(&refreshed).await, ProgressStatus::Complete);
        device
    }
}

/// Wait for a task with a generous deadline.
pub async fn finish(progress: &ProgressContainer) -> ProgressStatus {
    progress
        .wait_timeout(Duration::from_secs(10))
        .await
        .expect("Task did not finish in time")
}

/// Assert the live state of `entity` equals what the store holds.
pub async fn assert_in_sync<S: EntityState + PartialEq>(store: &MemoryStore, entity: &Entity<S>) {
    let record = store
        .get(entity.handle())
        .await
        .expect("Failed to read store")
        .expect("Entity missing from store");
    assert_eq!(entity.revision(), record.revision, "revision diverged");
    let stored: S = serde_json::from_value(record.body).expect("Failed to decode stored body");
    assert_eq!(
        entity.snapshot().await.expect("Entity was deleted"),
        stored,
        "live state diverged from store"
    );
}
