// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Simulated device protocol.
//!
//! An in-process appliance simulation that answers probes and applies changes
//! without touching the network. Tests script it (take devices offline, drop
//! subscriptions, tamper with configuration); the development binary uses it
//! as a stand-in fleet.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetward_core::{Error, Result};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ChangeOutcome, ChangeRequest, DeviceProtocol, DomainProbe, ProbeReport};
use crate::store::checksum;

/// Simulated appliance state.
#[derive(Debug, Clone, Default)]
struct SimDevice {
    reachable: bool,
    firmware_level: String,
    subscribed: bool,
    quiesced: bool,
    domains: BTreeMap<String, Vec<u8>>,
    /// Probes still answered as unreachable while the device reboots.
    rebooting_for: u32,
    probes: u32,
    applied: Vec<&'static str>,
}

/// Scriptable in-process device fleet.
pub struct SimulatedProtocol {
    devices: Arc<Mutex<HashMap<String, SimDevice>>>,
    /// Probes a device answers as unreachable after a firmware push.
    pub reboot_probes: u32,
    /// Delay added to every call (in milliseconds).
    pub latency_ms: u64,
    fail_applies: AtomicBool,
}

impl Default for SimulatedProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProtocol {
    /// Create an empty simulated fleet.
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            reboot_probes: 1,
            latency_ms: 0,
            fail_applies: AtomicBool::new(false),
        }
    }

    /// Set how many probes a device stays down after a firmware push.
    pub fn with_reboot_probes(mut self, probes: u32) -> Self {
        self.reboot_probes = probes;
        self
    }

    /// Set the per-call latency.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Add a reachable, unsubscribed device.
    pub async fn add_device(&self, address: &str, firmware_level: &str) {
        self.devices.lock().await.insert(
            address.to_string(),
            SimDevice {
                reachable: true,
                firmware_level: firmware_level.to_string(),
                ..Default::default()
            },
        );
    }

    /// Take a device offline or bring it back.
    pub async fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(device) = self.devices.lock().await.get_mut(address) {
            device.reachable = reachable;
        }
    }

    /// Make the device forget its subscription.
    pub async fn drop_subscription(&self, address: &str) {
        if let Some(device) = self.devices.lock().await.get_mut(address) {
            device.subscribed = false;
        }
    }

    /// Change the running firmware level behind the manager's back.
    pub async fn set_firmware_level(&self, address: &str, level: &str) {
        if let Some(device) = self.devices.lock().await.get_mut(address) {
            device.firmware_level = level.to_string();
        }
    }

    /// Overwrite a domain's configuration behind the manager's back.
    pub async fn tamper_domain(&self, address: &str, domain: &str, payload: &[u8]) {
        if let Some(device) = self.devices.lock().await.get_mut(address) {
            device.domains.insert(domain.to_string(), payload.to_vec());
        }
    }

    /// Make every subsequent `apply` fail (or succeed again).
    pub fn set_fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    /// Number of probes a device has answered (reachable or not).
    pub async fn probe_count(&self, address: &str) -> u32 {
        self.devices
            .lock()
            .await
            .get(address)
            .map_or(0, |d| d.probes)
    }

    /// Kinds of changes applied to a device, in order.
    pub async fn applied(&self, address: &str) -> Vec<&'static str> {
        self.devices
            .lock()
            .await
            .get(address)
            .map(|d| d.applied.clone())
            .unwrap_or_default()
    }

    /// Whether the device streams events to the manager.
    pub async fn is_subscribed(&self, address: &str) -> bool {
        self.devices
            .lock()
            .await
            .get(address)
            .is_some_and(|d| d.subscribed)
    }

    /// Whether the device is quiesced.
    pub async fn is_quiesced(&self, address: &str) -> bool {
        self.devices
            .lock()
            .await
            .get(address)
            .is_some_and(|d| d.quiesced)
    }

    /// Running firmware level.
    pub async fn firmware_level(&self, address: &str) -> Option<String> {
        self.devices
            .lock()
            .await
            .get(address)
            .map(|d| d.firmware_level.clone())
    }

    /// Active configuration of a domain.
    pub async fn domain_payload(&self, address: &str, domain: &str) -> Option<Vec<u8>> {
        self.devices
            .lock()
            .await
            .get(address)
            .and_then(|d| d.domains.get(domain).cloned())
    }

    async fn delay(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
    }
}

fn unknown(address: &str) -> Error {
    Error::protocol(address, "unknown device")
}

fn ensure_reachable(address: &str, device: &SimDevice) -> Result<()> {
    if device.reachable && device.rebooting_for == 0 {
        Ok(())
    } else {
        Err(Error::protocol(address, "device unreachable"))
    }
}

#[async_trait]
impl DeviceProtocol for SimulatedProtocol {
    async fn probe(&self, address: &str) -> Result<ProbeReport> {
        self.delay().await;
        let mut devices = self.devices.lock().await;
        let device = devices.get_mut(address).ok_or_else(|| unknown(address))?;
        device.probes += 1;

        if device.rebooting_for > 0 {
            device.rebooting_for -= 1;
            return Ok(ProbeReport::unreachable());
        }
        if !device.reachable {
            return Ok(ProbeReport::unreachable());
        }
        Ok(ProbeReport {
            reachable: true,
            firmware_level: Some(device.firmware_level.clone()),
            subscribed: device.subscribed,
            quiesced: device.quiesced,
        })
    }

    async fn probe_domain(&self, address: &str, domain: &str) -> Result<DomainProbe> {
        self.delay().await;
        let devices = self.devices.lock().await;
        let device = devices.get(address).ok_or_else(|| unknown(address))?;
        ensure_reachable(address, device)?;
        Ok(DomainProbe {
            checksum: device.domains.get(domain).map(|p| checksum(p)),
        })
    }

    async fn apply(&self, address: &str, change: ChangeRequest) -> Result<ChangeOutcome> {
        self.delay().await;
        let mut devices = self.devices.lock().await;
        let device = devices.get_mut(address).ok_or_else(|| unknown(address))?;
        ensure_reachable(address, device)?;
        if self.fail_applies.load(Ordering::SeqCst) {
            return Err(Error::protocol(address, "change rejected"));
        }

        let kind = change.kind();
        let mut outcome = ChangeOutcome::default();
        match change {
            ChangeRequest::Firmware { level, .. } => {
                device.firmware_level = level;
                device.subscribed = false;
                device.rebooting_for = self.reboot_probes;
            }
            ChangeRequest::Domain { name, payload } => {
                device.domains.insert(name, payload);
            }
            ChangeRequest::Backup => {
                let exported = serde_json::to_vec(&device.domains)?;
                outcome.payload = Some(exported);
            }
            ChangeRequest::Restore { payload } => {
                let restored: BTreeMap<String, Vec<u8>> = serde_json::from_slice(&payload)
                    .map_err(|e| Error::protocol(address, format!("invalid backup: {}", e)))?;
                device.domains = restored;
            }
            ChangeRequest::Quiesce => device.quiesced = true,
            ChangeRequest::Unquiesce => device.quiesced = false,
        }
        device.applied.push(kind);
        debug!(address = %address, change = kind, "Simulated change applied");
        Ok(outcome)
    }

    async fn subscribe(&self, address: &str) -> Result<()> {
        self.delay().await;
        let mut devices = self.devices.lock().await;
        let device = devices.get_mut(address).ok_or_else(|| unknown(address))?;
        ensure_reachable(address, device)?;
        device.subscribed = true;
        Ok(())
    }

    async fn unsubscribe(&self, address: &str) -> Result<()> {
        self.delay().await;
        let mut devices = self.devices.lock().await;
        let device = devices.get_mut(address).ok_or_else(|| unknown(address))?;
        ensure_reachable(address, device)?;
        device.subscribed = false;
        Ok(())
    }
}
