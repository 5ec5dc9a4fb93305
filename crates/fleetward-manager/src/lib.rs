// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetward Manager - Device Fleet Management
//!
//! Builds the fleet domain on top of `fleetward-core`: devices grouped into
//! managed sets, configuration domains, firmware lines and backups, all
//! persisted through a [`Store`] and driven through a [`DeviceProtocol`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      FleetRuntime                         │
//! │  ┌───────────────┐  ┌──────────────────┐                  │
//! │  │ heartbeat     │  │ domain-sync      │  reconciliation  │
//! │  │ daemon        │  │ daemon           │  daemons         │
//! │  └──────┬────────┘  └────────┬─────────┘                  │
//! │         │ corrective tasks   │                            │
//! │         ▼                    ▼                            │
//! │  ┌────────────────────────────────────────┐               │
//! │  │ FleetManager                            │               │
//! │  │  mappers: devices, sets, domains, fw    │──▶ Store      │
//! │  │  operations ──▶ QueueProcessor          │──▶ Protocol   │
//! │  └────────────────────────────────────────┘               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`model`] | Live entities and their persisted state |
//! | [`manager`] | Application context, membership changes, versions |
//! | [`daemons`] | Heartbeat and domain-sync reconciliation |
//! | [`store`] | Durable store trait, in-memory and SQLite stores |
//! | [`protocol`] | Device protocol trait and the simulated appliance |
//! | [`runtime`] | Embeddable runtime with graceful shutdown |
//! | [`config`] | Environment-based configuration |

#![warn(missing_docs)]

pub mod config;
pub mod daemons;
pub mod error;
pub mod manager;
pub mod model;
mod operations;
pub mod protocol;
pub mod runtime;
pub mod store;

pub use config::{Config, ConfigError};
pub use daemons::{
    DomainSyncReconciler, FailureTracker, HeartbeatReconciler, ProbeOutcome, ReconcileConfig,
    Reconciler, ReconciliationDaemon, TickSummary,
};
pub use error::{Error, Result};
pub use manager::{FleetManager, FleetStatus, ManagerSettings};
pub use model::{
    Device, DeviceState, Domain, DomainState, Entity, EntityState, Firmware, FirmwareState,
    ManagedSet, ManagedSetState, OperationalStatus,
};
pub use protocol::{DeviceProtocol, SimulatedProtocol};
pub use runtime::FleetRuntime;
pub use store::{MemoryStore, SqliteStore, Store};
