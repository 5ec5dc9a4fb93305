// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain-synchronization reconciliation.
//!
//! Probes auto-sync domains on reachable devices and redeploys the desired
//! version when the configuration on the device no longer matches what was
//! deployed, or when the desired version has not been deployed yet.

use std::sync::Arc;

use async_trait::async_trait;
use fleetward_core::{EntityHandle, Lockable, Result};
use tracing::debug;

use super::{ProbeOutcome, Reconciler};
use crate::manager::FleetManager;
use crate::model::OperationalStatus;

/// Probe logic of the domain-sync daemon.
pub struct DomainSyncReconciler {
    manager: Arc<FleetManager>,
}

impl DomainSyncReconciler {
    /// Create a reconciler for `manager`'s domains.
    pub fn new(manager: Arc<FleetManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Reconciler for DomainSyncReconciler {
    fn name(&self) -> &'static str {
        "domain-sync"
    }

    async fn targets(&self) -> Result<Vec<EntityHandle>> {
        let mut targets = Vec::new();
        for domain in self.manager.domains().await {
            let Ok(state) = domain.snapshot().await else {
                continue;
            };
            if !state.auto_sync || state.desired_version.is_none() {
                continue;
            }
            let Ok(device) = self.manager.device(&state.device).await else {
                continue;
            };
            if device.read(|s| s.status == OperationalStatus::Up).await.unwrap_or(false) {
                targets.push(domain.handle().clone());
            }
        }
        Ok(targets)
    }

    async fn reconcile(&self, target: &EntityHandle, attempt: u32) -> Result<ProbeOutcome> {
        let domain = self.manager.domain(target).await?;
        let state = domain.snapshot().await?;
        let device = self.manager.device(&state.device).await?;
        if device.resource_lock().is_locked() || domain.resource_lock().is_locked() {
            return Ok(ProbeOutcome::Skipped {
                reason: "domain busy".to_string(),
            });
        }

        let address = device.read(|s| s.address.clone()).await?;
        let observed = self
            .manager
            .protocol()
            .probe_domain(&address, &state.name)
            .await?;

        let drifted = observed.checksum != state.deployed_checksum;
        let behind = state.deployed_version != state.desired_version;
        if !drifted && !behind {
            return Ok(ProbeOutcome::InSync);
        }

        debug!(
            domain = %target,
            drifted,
            behind,
            "Domain out of sync"
        );
        let progress = self
            .manager
            .submit_deploy(&domain, None, Some(attempt))
            .await?;
        Ok(ProbeOutcome::Corrected {
            action: "redeploy",
            progress,
        })
    }
}
