// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Heartbeat reconciliation.
//!
//! Probes every subscribed device. A device that lost its subscription is
//! resubscribed; a device reporting a firmware level other than the recorded
//! one gets its info refreshed; an unreachable device is marked as such and
//! counts as a failed probe. Devices whose lock is held are skipped, since a
//! running task (a firmware push, say) may legitimately take them offline.

use std::sync::Arc;

use async_trait::async_trait;
use fleetward_core::{EntityHandle, Error, Lockable, Result};
use tracing::debug;

use super::{ProbeOutcome, Reconciler};
use crate::manager::FleetManager;
use crate::model::OperationalStatus;

/// Probe logic of the heartbeat daemon.
pub struct HeartbeatReconciler {
    manager: Arc<FleetManager>,
}

impl HeartbeatReconciler {
    /// Create a reconciler for `manager`'s devices.
    pub fn new(manager: Arc<FleetManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Reconciler for HeartbeatReconciler {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn targets(&self) -> Result<Vec<EntityHandle>> {
        let mut targets = Vec::new();
        for device in self.manager.devices().await {
            if device.read(|s| s.subscribed).await.unwrap_or(false) {
                targets.push(device.handle().clone());
            }
        }
        Ok(targets)
    }

    async fn reconcile(&self, target: &EntityHandle, attempt: u32) -> Result<ProbeOutcome> {
        let device = self.manager.device(target).await?;
        if device.resource_lock().is_locked() {
            return Ok(ProbeOutcome::Skipped {
                reason: "device busy".to_string(),
            });
        }

        let (address, recorded_level, status) = device
            .read(|s| (s.address.clone(), s.firmware_level.clone(), s.status))
            .await?;
        let report = self.manager.protocol().probe(&address).await?;

        if !report.reachable {
            // A task that grabbed the device meanwhile owns its state.
            if let Ok(guard) = device.resource_lock().lock_no_wait() {
                self.manager.record_probe(&device, &report).await?;
                guard.unlock();
            }
            return Err(Error::protocol(address, "device unreachable"));
        }

        if !report.subscribed {
            debug!(device = %target, "Device lost its subscription");
            let progress = self.manager.submit_subscribe(&device, Some(attempt)).await?;
            return Ok(ProbeOutcome::Corrected {
                action: "resubscribe",
                progress,
            });
        }

        if report.firmware_level.is_some() && report.firmware_level != recorded_level {
            debug!(
                device = %target,
                recorded = ?recorded_level,
                reported = ?report.firmware_level,
                "Firmware level changed"
            );
            let progress = self.manager.submit_refresh(&device, Some(attempt)).await?;
            return Ok(ProbeOutcome::Corrected {
                action: "refresh-device-info",
                progress,
            });
        }

        if matches!(
            status,
            OperationalStatus::Unknown | OperationalStatus::Unreachable
        ) && let Ok(guard) = device.resource_lock().lock_no_wait()
        {
            self.manager.record_probe(&device, &report).await?;
            guard.unlock();
        }
        Ok(ProbeOutcome::InSync)
    }
}
