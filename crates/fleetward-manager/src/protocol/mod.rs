// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Device protocol collaborator.
//!
//! The manager only needs opaque "probe state" and "apply change" semantics
//! from the wire protocol. Failures are reported as `Protocol` errors, which
//! are retryable.

pub mod simulated;

pub use self::simulated::SimulatedProtocol;

use async_trait::async_trait;
use fleetward_core::Result;
use serde::{Deserialize, Serialize};

/// Observed device state returned by a heartbeat probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Whether the device answered.
    pub reachable: bool,
    /// Running firmware level, if reported.
    pub firmware_level: Option<String>,
    /// Whether the device currently streams events to the manager.
    pub subscribed: bool,
    /// Whether the device is quiesced.
    pub quiesced: bool,
}

impl ProbeReport {
    /// Report for a device that did not answer.
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            firmware_level: None,
            subscribed: false,
            quiesced: false,
        }
    }
}

/// Observed state of one configuration domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainProbe {
    /// Checksum of the configuration currently active on the device, `None`
    /// if the domain holds no configuration.
    pub checksum: Option<String>,
}

/// A device-affecting change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRequest {
    /// Install a firmware image and reboot.
    Firmware {
        /// Firmware level the image carries.
        level: String,
        /// Image bytes.
        image: Vec<u8>,
    },
    /// Replace a domain's configuration.
    Domain {
        /// Domain name.
        name: String,
        /// Configuration bytes.
        payload: Vec<u8>,
    },
    /// Export the device configuration.
    Backup,
    /// Restore a previously exported configuration.
    Restore {
        /// Backup bytes.
        payload: Vec<u8>,
    },
    /// Stop taking traffic.
    Quiesce,
    /// Resume taking traffic.
    Unquiesce,
}

impl ChangeRequest {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeRequest::Firmware { .. } => "firmware",
            ChangeRequest::Domain { .. } => "domain",
            ChangeRequest::Backup => "backup",
            ChangeRequest::Restore { .. } => "restore",
            ChangeRequest::Quiesce => "quiesce",
            ChangeRequest::Unquiesce => "unquiesce",
        }
    }
}

/// Result of an applied change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeOutcome {
    /// Data returned by the device (backup contents).
    pub payload: Option<Vec<u8>>,
}

/// Wire protocol to the devices.
#[async_trait]
pub trait DeviceProtocol: Send + Sync {
    /// Probe a device's state.
    async fn probe(&self, address: &str) -> Result<ProbeReport>;

    /// Probe one configuration domain.
    async fn probe_domain(&self, address: &str, domain: &str) -> Result<DomainProbe>;

    /// Apply a change.
    async fn apply(&self, address: &str, change: ChangeRequest) -> Result<ChangeOutcome>;

    /// Subscribe to the device's event stream.
    async fn subscribe(&self, address: &str) -> Result<()>;

    /// Cancel the subscription.
    async fn unsubscribe(&self, address: &str) -> Result<()>;
}
