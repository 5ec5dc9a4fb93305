// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet entities.
//!
//! Every entity is an [`Entity<S>`]: a durable handle with its liveness token,
//! a [`ResourceLock`], the stored revision, and the typed state `S`. Accessors
//! re-validate liveness, so a reference held across a removal fails with
//! `Deleted` instead of reading stale state.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use fleetward_core::{
    EntityHandle, Error, Liveness, LockRank, Lockable, Persistable, ResourceLock, Result, Versioned,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::store::{EntityKind, EntityRecord, Store};

/// Typed state of a stored entity.
pub trait EntityState:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stored kind.
    const KIND: EntityKind;
    /// Rank of the entity's lock.
    const RANK: LockRank;
}

/// A live entity.
pub struct Entity<S: EntityState> {
    liveness: Liveness,
    lock: ResourceLock,
    revision: AtomicI64,
    state: RwLock<S>,
    persisting: Mutex<()>,
}

/// A network appliance.
pub type Device = Entity<DeviceState>;
/// A group of devices sharing one work area.
pub type ManagedSet = Entity<ManagedSetState>;
/// A configuration domain on a device.
pub type Domain = Entity<DomainState>;
/// Firmware images for one device model.
pub type Firmware = Entity<FirmwareState>;

impl<S: EntityState> fmt::Debug for Entity<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("kind", &S::KIND)
            .field("handle", self.liveness.handle())
            .field("revision", &self.revision())
            .field("deleted", &self.liveness.is_deleted())
            .finish()
    }
}

impl<S: EntityState> Entity<S> {
    fn new(handle: EntityHandle, revision: i64, state: S) -> Self {
        let lock = ResourceLock::new(format!("{}:{}", S::KIND, handle), S::RANK);
        Self {
            liveness: Liveness::new(handle),
            lock,
            revision: AtomicI64::new(revision),
            state: RwLock::new(state),
            persisting: Mutex::new(()),
        }
    }

    /// Persist `state` as a new entity.
    pub async fn create(store: &dyn Store, state: S) -> Result<Self> {
        let body = serde_json::to_value(&state)?;
        let record = store.create(S::KIND, body).await?;
        Ok(Self::new(record.handle, record.revision, state))
    }

    /// Materialise a stored record.
    pub fn from_record(record: EntityRecord) -> Result<Self> {
        if record.kind != S::KIND {
            return Err(Error::InvalidRequest(format!(
                "entity '{}' is a {}, not a {}",
                record.handle,
                record.kind,
                S::KIND
            )));
        }
        let state: S = serde_json::from_value(record.body)?;
        Ok(Self::new(record.handle, record.revision, state))
    }

    /// Durable handle.
    pub fn handle(&self) -> &EntityHandle {
        self.liveness.handle()
    }

    /// Whether the entity was destroyed.
    pub fn is_deleted(&self) -> bool {
        self.liveness.is_deleted()
    }

    /// Last revision written or loaded.
    pub fn revision(&self) -> i64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> Result<S> {
        self.liveness.check()?;
        Ok(self.state.read().await.clone())
    }

    /// Read a projection of the state.
    pub async fn read<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R> {
        self.liveness.check()?;
        let state = self.state.read().await;
        Ok(f(&state))
    }

    /// Save the state against the last known revision.
    ///
    /// Fails with `Conflict` if storage moved on, `Deleted` if the entity is
    /// gone.
    pub async fn persist(&self, store: &dyn Store) -> Result<()> {
        self.liveness.check()?;
        let _saving = self.persisting.lock().await;
        let body = serde_json::to_value(&*self.state.read().await)?;
        let revision = store.save(self.handle(), self.revision(), body).await?;
        self.revision.store(revision, Ordering::Release);
        Ok(())
    }

    /// Save the state whatever revision storage holds.
    pub async fn persist_forced(&self, store: &dyn Store) -> Result<()> {
        self.liveness.check()?;
        let _saving = self.persisting.lock().await;
        let body = serde_json::to_value(&*self.state.read().await)?;
        let revision = store.save_forced(self.handle(), body).await?;
        self.revision.store(revision, Ordering::Release);
        Ok(())
    }

    /// Replace the in-memory state and revision with what storage holds.
    pub async fn reload(&self, store: &dyn Store) -> Result<()> {
        self.liveness.check()?;
        let _saving = self.persisting.lock().await;
        let record = store.get(self.handle()).await?.ok_or_else(|| Error::Deleted {
            handle: self.handle().to_string(),
        })?;
        let state: S = serde_json::from_value(record.body)?;
        *self.state.write().await = state;
        self.revision.store(record.revision, Ordering::Release);
        Ok(())
    }

    /// Apply `f` and save the result.
    ///
    /// `f` runs on a copy of the state; the live state changes only once
    /// storage accepted the copy, so a failed save leaves it untouched. On
    /// `Conflict` the entity is reloaded and `f` applied once more to the
    /// stored state.
    pub async fn update<R>(
        &self,
        store: &dyn Store,
        mut f: impl FnMut(&mut S) -> R,
    ) -> Result<R> {
        match self.try_update(store, &mut f).await {
            Err(Error::Conflict { expected, actual, .. }) => {
                debug!(
                    entity = %self.handle(),
                    expected,
                    actual,
                    "Stale revision, reloading before retry"
                );
                self.reload(store).await?;
                self.try_update(store, &mut f).await
            }
            other => other,
        }
    }

    async fn try_update<R>(
        &self,
        store: &dyn Store,
        f: &mut impl FnMut(&mut S) -> R,
    ) -> Result<R> {
        self.liveness.check()?;
        let _saving = self.persisting.lock().await;
        let mut next = self.state.read().await.clone();
        let out = f(&mut next);
        let body = serde_json::to_value(&next)?;
        let revision = store.save(self.handle(), self.revision(), body).await?;
        *self.state.write().await = next;
        self.revision.store(revision, Ordering::Release);
        Ok(out)
    }
}

impl<S: EntityState> Persistable for Entity<S> {
    fn liveness(&self) -> &Liveness {
        &self.liveness
    }
}

impl<S: EntityState> Lockable for Entity<S> {
    fn resource_lock(&self) -> &ResourceLock {
        &self.lock
    }
}

/// Operational status of a device as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalStatus {
    /// Not probed yet.
    #[default]
    Unknown,
    /// Reachable and taking traffic.
    Up,
    /// Did not answer the last probe.
    Unreachable,
    /// Reachable but quiesced.
    Quiesced,
}

/// Device state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Display name.
    pub name: String,
    /// Protocol address.
    pub address: String,
    /// Device model, selects the firmware line.
    pub model: String,
    /// Managed set the device belongs to.
    #[serde(default)]
    pub managed_set: Option<EntityHandle>,
    /// Whether the manager wants an event subscription.
    #[serde(default)]
    pub subscribed: bool,
    /// Firmware level last reported by the device.
    #[serde(default)]
    pub firmware_level: Option<String>,
    /// Firmware version last pushed.
    #[serde(default)]
    pub deployed_firmware: Option<u32>,
    /// Whether the device is quiesced.
    #[serde(default)]
    pub quiesced: bool,
    /// Last observed status.
    #[serde(default)]
    pub status: OperationalStatus,
    /// Configuration domains on the device.
    #[serde(default)]
    pub domains: Vec<EntityHandle>,
}

impl DeviceState {
    /// State of a newly added device.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            model: model.into(),
            managed_set: None,
            subscribed: false,
            firmware_level: None,
            deployed_firmware: None,
            quiesced: false,
            status: OperationalStatus::Unknown,
            domains: Vec::new(),
        }
    }
}

impl EntityState for DeviceState {
    const KIND: EntityKind = EntityKind::Device;
    const RANK: LockRank = LockRank::Device;
}

/// Managed set state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedSetState {
    /// Unique name.
    pub name: String,
    /// Queue capacity of the set's work area, `None` for the fleet default.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Member devices.
    #[serde(default)]
    pub members: Vec<EntityHandle>,
}

impl EntityState for ManagedSetState {
    const KIND: EntityKind = EntityKind::ManagedSet;
    const RANK: LockRank = LockRank::ManagedSet;
}

/// Configuration domain state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainState {
    /// Owning device.
    pub device: EntityHandle,
    /// Domain name, unique per device.
    pub name: String,
    /// Whether the domain-sync daemon keeps the device in line.
    #[serde(default)]
    pub auto_sync: bool,
    /// Version the device should run.
    #[serde(default)]
    pub desired_version: Option<u32>,
    /// Version last deployed.
    #[serde(default)]
    pub deployed_version: Option<u32>,
    /// Checksum of the deployed configuration.
    #[serde(default)]
    pub deployed_checksum: Option<String>,
}

impl EntityState for DomainState {
    const KIND: EntityKind = EntityKind::Domain;
    const RANK: LockRank = LockRank::Domain;
}

/// Firmware line state. Images are stored as versions labelled with their
/// firmware level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareState {
    /// Device model the images apply to.
    pub model: String,
}

impl EntityState for FirmwareState {
    const KIND: EntityKind = EntityKind::Firmware;
    const RANK: LockRank = LockRank::Firmware;
}

/// Stored version history of one entity, with its in-use set computed by
/// the caller at trim time.
pub struct VersionHistory {
    owner: EntityHandle,
    description: String,
    store: Arc<dyn Store>,
    in_use: BTreeSet<u32>,
}

impl VersionHistory {
    /// History of `owner`.
    pub fn new(
        owner: EntityHandle,
        description: impl Into<String>,
        store: Arc<dyn Store>,
        in_use: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            owner,
            description: description.into(),
            store,
            in_use: in_use.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Versioned for VersionHistory {
    fn version_owner(&self) -> String {
        format!("{} {}", self.description, self.owner)
    }

    async fn version_numbers(&self) -> Result<Vec<u32>> {
        Ok(self
            .store
            .list_versions(&self.owner)
            .await?
            .into_iter()
            .map(|v| v.version)
            .collect())
    }

    async fn is_version_in_use(&self, version: u32) -> Result<bool> {
        Ok(self.in_use.contains(&version))
    }

    async fn delete_version(&self, version: u32) -> Result<()> {
        self.store.delete_version(&self.owner, version).await?;
        Ok(())
    }
}
