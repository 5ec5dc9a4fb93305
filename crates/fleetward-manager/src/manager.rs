// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet manager application context.
//!
//! [`FleetManager`] owns the collaborators (store, protocol, queue processor)
//! and one [`PersistenceMapper`] per entity type. It is built once at startup
//! and shared as an `Arc` with the daemons and the runtime.
//!
//! Membership changes (creating sets, adding, moving and removing devices)
//! run in the foreground under ordered locks. Device-affecting work is queued
//! to the device's work area: the managed set it belongs to, or the manager
//! area for unmanaged devices. See the `operations` module.

use std::sync::Arc;
use std::time::Duration;

use fleetward_core::{
    BackgroundTask, EntityHandle, Error, LockRank, Lockable, MacroProgressContainer,
    PersistenceMapper, ProgressContainer, QueueProcessor, ResourceLock, Result, RetentionReport,
    TaskOrigin, WorkAreaId, WorkAreaStats, lock_ordered, trim_versions,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{
    Device, DeviceState, Domain, DomainState, Entity, EntityState, Firmware, FirmwareState,
    ManagedSet, ManagedSetState, VersionHistory,
};
use crate::protocol::DeviceProtocol;
use crate::store::{EntityKind, Store, VersionRecord};

/// Tunables of the fleet manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Default queue capacity per work area (`None` = unbounded).
    pub queue_capacity: Option<usize>,
    /// Versions kept per versioned entity.
    pub max_versions_to_store: usize,
    /// Deadline for quiesce/unquiesce.
    pub quiesce_timeout: Duration,
    /// Deadline for a device to come back after a firmware push.
    pub firmware_reboot_timeout: Duration,
    /// Probe interval while waiting for a rebooting device.
    pub reboot_poll_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            max_versions_to_store: 5,
            quiesce_timeout: Duration::from_secs(30),
            firmware_reboot_timeout: Duration::from_secs(300),
            reboot_poll_interval: Duration::from_secs(5),
        }
    }
}

impl ManagerSettings {
    /// Settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            max_versions_to_store: config.max_versions_to_store,
            quiesce_timeout: config.quiesce_timeout,
            firmware_reboot_timeout: config.firmware_reboot_timeout,
            ..Default::default()
        }
    }
}

/// Point-in-time view of the fleet.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    /// Whether ordinary tasks are still accepted.
    pub accepting: bool,
    /// Live devices.
    pub devices: usize,
    /// Live managed sets.
    pub managed_sets: usize,
    /// Live configuration domains.
    pub domains: usize,
    /// Firmware lines.
    pub firmware_lines: usize,
    /// Per work area queue statistics.
    pub work_areas: Vec<WorkAreaStats>,
}

/// The fleet manager.
pub struct FleetManager {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) protocol: Arc<dyn DeviceProtocol>,
    pub(crate) processor: Arc<QueueProcessor>,
    pub(crate) settings: ManagerSettings,
    /// Guards the unmanaged device list and fleet-wide membership changes.
    lock: ResourceLock,
    devices: PersistenceMapper<Device>,
    managed_sets: PersistenceMapper<ManagedSet>,
    domains: PersistenceMapper<Domain>,
    firmware: PersistenceMapper<Firmware>,
}

impl FleetManager {
    /// Create the manager and register its work area with `processor`.
    pub async fn new(
        store: Arc<dyn Store>,
        protocol: Arc<dyn DeviceProtocol>,
        processor: Arc<QueueProcessor>,
        settings: ManagerSettings,
    ) -> Result<Arc<Self>> {
        match processor
            .register_work_area(WorkAreaId::Manager, settings.queue_capacity)
            .await
        {
            Ok(_) | Err(Error::AlreadyRegistered { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(Arc::new(Self {
            store,
            protocol,
            processor,
            settings,
            lock: ResourceLock::new("manager", LockRank::Manager),
            devices: PersistenceMapper::new(),
            managed_sets: PersistenceMapper::new(),
            domains: PersistenceMapper::new(),
            firmware: PersistenceMapper::new(),
        }))
    }

    /// Durable store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Device protocol.
    pub fn protocol(&self) -> &Arc<dyn DeviceProtocol> {
        &self.protocol
    }

    /// Queue processor.
    pub fn processor(&self) -> &Arc<QueueProcessor> {
        &self.processor
    }

    /// Tunables.
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Resolve a device handle, loading it from the store on first use.
    pub async fn device(&self, handle: &EntityHandle) -> Result<Arc<Device>> {
        self.devices
            .get_or_load(handle, || self.load_entity(handle))
            .await
    }

    /// Resolve a managed set handle.
    pub async fn managed_set(&self, handle: &EntityHandle) -> Result<Arc<ManagedSet>> {
        let set = self
            .managed_sets
            .get_or_load(handle, || self.load_entity(handle))
            .await?;
        self.ensure_set_area(&set).await?;
        Ok(set)
    }

    /// Resolve a domain handle.
    pub async fn domain(&self, handle: &EntityHandle) -> Result<Arc<Domain>> {
        self.domains
            .get_or_load(handle, || self.load_entity(handle))
            .await
    }

    /// Live devices.
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.live_objects().await
    }

    /// Live managed sets.
    pub async fn managed_sets(&self) -> Vec<Arc<ManagedSet>> {
        self.managed_sets.live_objects().await
    }

    /// Live configuration domains.
    pub async fn domains(&self) -> Vec<Arc<Domain>> {
        self.domains.live_objects().await
    }

    /// Firmware line of a device model, if any image was added for it.
    pub async fn firmware_for_model(&self, model: &str) -> Option<Arc<Firmware>> {
        for firmware in self.firmware.live_objects().await {
            if firmware.read(|f| f.model == model).await.unwrap_or(false) {
                return Some(firmware);
            }
        }
        None
    }

    /// Work area that serializes tasks for `device`.
    pub async fn work_area_for(&self, device: &Device) -> Result<WorkAreaId> {
        Ok(device
            .read(|s| s.managed_set.clone())
            .await?
            .map_or(WorkAreaId::Manager, |set| {
                WorkAreaId::managed_set(set.as_str())
            }))
    }

    async fn load_entity<S: EntityState>(
        &self,
        handle: &EntityHandle,
    ) -> Result<Option<Entity<S>>> {
        match self.store.get(handle).await? {
            Some(record) => Entity::from_record(record).map(Some),
            None => Ok(None),
        }
    }

    async fn ensure_set_area(&self, set: &ManagedSet) -> Result<()> {
        let capacity = set
            .read(|s| s.queue_capacity)
            .await?
            .or(self.settings.queue_capacity);
        match self
            .processor
            .register_work_area(WorkAreaId::managed_set(set.handle().as_str()), capacity)
            .await
        {
            Ok(_) | Err(Error::AlreadyRegistered { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Managed Sets
    // ========================================================================

    /// Create a managed set and its work area.
    pub async fn create_managed_set(
        &self,
        name: &str,
        queue_capacity: Option<usize>,
    ) -> Result<Arc<ManagedSet>> {
        let _guard = self.lock.lock_wait().await;
        for set in self.managed_sets.live_objects().await {
            if set.read(|s| s.name == name).await.unwrap_or(false) {
                return Err(Error::InvalidRequest(format!(
                    "managed set '{}' already exists",
                    name
                )));
            }
        }

        let set = ManagedSet::create(
            self.store.as_ref(),
            ManagedSetState {
                name: name.to_string(),
                queue_capacity,
                members: Vec::new(),
            },
        )
        .await?;
        let set = self.managed_sets.add(Arc::new(set)).await?;
        self.ensure_set_area(&set).await?;

        info!(managed_set = %set.handle(), name = %name, "Managed set created");
        Ok(set)
    }

    /// Destroy an empty managed set, draining its work area.
    pub async fn destroy_managed_set(&self, handle: &EntityHandle) -> Result<()> {
        let set = self.managed_set(handle).await?;
        let _guards = lock_ordered(&[&self.lock, set.resource_lock()]).await;

        let members = set.read(|s| s.members.len()).await?;
        if members > 0 {
            return Err(Error::InvalidRequest(format!(
                "managed set '{}' still has {} devices",
                handle, members
            )));
        }

        match self
            .processor
            .unregister_work_area(&WorkAreaId::managed_set(handle.as_str()))
            .await
        {
            Ok(()) | Err(Error::UnknownWorkArea(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.delete(handle).await?;
        self.managed_sets.remove(handle).await;

        info!(managed_set = %handle, "Managed set destroyed");
        Ok(())
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Add a device and queue its subscription.
    ///
    /// The device is created in the foreground; the returned container
    /// tracks the background subscribe.
    pub async fn add_device(
        self: &Arc<Self>,
        name: &str,
        address: &str,
        model: &str,
        managed_set: Option<&EntityHandle>,
    ) -> Result<(Arc<Device>, Arc<ProgressContainer>)> {
        let set = match managed_set {
            Some(handle) => Some(self.managed_set(handle).await?),
            None => None,
        };
        let mut locks = vec![&self.lock];
        locks.extend(set.iter().map(|s| s.resource_lock()));
        let guards = lock_ordered(&locks).await;

        for existing in self.devices.live_objects().await {
            if existing
                .read(|s| s.address == address)
                .await
                .unwrap_or(false)
            {
                return Err(Error::InvalidRequest(format!(
                    "address '{}' is already managed by device '{}'",
                    address,
                    existing.handle()
                )));
            }
        }

        let mut state = DeviceState::new(name, address, model);
        state.managed_set = managed_set.cloned();
        let device = Device::create(self.store.as_ref(), state).await?;
        let device = self.devices.add(Arc::new(device)).await?;

        if let Some(set) = &set
            && let Err(e) = set
                .update(self.store.as_ref(), |s| s.members.push(device.handle().clone()))
                .await
        {
            self.discard_device(&device).await;
            return Err(e);
        }
        drop(guards);

        info!(device = %device.handle(), address = %address, "Device added");
        let progress = self.submit_subscribe(&device, None).await?;
        Ok((device, progress))
    }

    /// Remove a device and its domains, then unsubscribe it in the
    /// background.
    pub async fn remove_device(&self, handle: &EntityHandle) -> Result<Arc<ProgressContainer>> {
        let device = self.device(handle).await?;
        let set = match device.read(|s| s.managed_set.clone()).await? {
            Some(set) => Some(self.managed_set(&set).await?),
            None => None,
        };

        let mut locks = vec![&self.lock, device.resource_lock()];
        if let Some(set) = &set {
            locks.push(set.resource_lock());
        }
        let guards = lock_ordered(&locks).await;

        let area = self.work_area_for(&device).await?;
        let state = device.snapshot().await?;
        if let Some(set) = &set {
            set.update(self.store.as_ref(), |s| s.members.retain(|m| m != handle))
                .await?;
        }
        if let Err(e) = self.store.delete(handle).await {
            self.rejoin(handle, set.as_deref(), None).await;
            return Err(e);
        }
        self.devices.remove(handle).await;
        for domain in &state.domains {
            if let Err(e) = self.store.delete(domain).await {
                warn!(domain = %domain, error = %e, "Failed to delete domain of removed device");
            }
            self.domains.remove(domain).await;
        }
        drop(guards);

        info!(device = %handle, "Device removed");

        let protocol = self.protocol.clone();
        let address = state.address;
        let subscribed = state.subscribed;
        let task = BackgroundTask::from_fn("unsubscribe", handle.to_string(), move |_| async move {
            if subscribed {
                protocol.unsubscribe(&address).await?;
            }
            Ok(None)
        })
        .with_origin(TaskOrigin::System);
        // Cleanup of an already deleted device must not be rejected.
        Ok(self.processor.privileged_enqueue(task, &area).await)
    }

    /// Move a device into a managed set, or out of any (`None`).
    pub async fn move_device(
        &self,
        handle: &EntityHandle,
        target: Option<&EntityHandle>,
    ) -> Result<()> {
        let device = self.device(handle).await?;
        let current = device.read(|s| s.managed_set.clone()).await?;
        if current.as_ref() == target {
            return Ok(());
        }

        let from = match &current {
            Some(set) => Some(self.managed_set(set).await?),
            None => None,
        };
        let to = match target {
            Some(set) => Some(self.managed_set(set).await?),
            None => None,
        };

        let mut locks = vec![&self.lock, device.resource_lock()];
        locks.extend(from.iter().map(|s| s.resource_lock()));
        locks.extend(to.iter().map(|s| s.resource_lock()));
        let _guards = lock_ordered(&locks).await;

        if let Some(set) = &from {
            set.update(self.store.as_ref(), |s| s.members.retain(|m| m != handle))
                .await?;
        }
        if let Some(set) = &to
            && let Err(e) = set
                .update(self.store.as_ref(), |s| s.members.push(handle.clone()))
                .await
        {
            self.rejoin(handle, from.as_deref(), None).await;
            return Err(e);
        }
        if let Err(e) = device
            .update(self.store.as_ref(), |s| s.managed_set = target.cloned())
            .await
        {
            self.rejoin(handle, from.as_deref(), to.as_deref()).await;
            return Err(e);
        }

        info!(
            device = %handle,
            from = ?current.as_ref().map(|h| h.as_str()),
            to = ?target.map(|h| h.as_str()),
            "Device moved"
        );
        Ok(())
    }

    /// Undo membership steps of a failed move or removal: put the device
    /// back into `previous` and take it out of `joined`.
    async fn rejoin(
        &self,
        handle: &EntityHandle,
        previous: Option<&ManagedSet>,
        joined: Option<&ManagedSet>,
    ) {
        if let Some(set) = joined
            && let Err(e) = set
                .update(self.store.as_ref(), |s| s.members.retain(|m| m != handle))
                .await
        {
            warn!(device = %handle, managed_set = %set.handle(), error = %e, "Failed to undo join");
        }
        if let Some(set) = previous
            && let Err(e) = set
                .update(self.store.as_ref(), |s| {
                    if !s.members.contains(handle) {
                        s.members.push(handle.clone());
                    }
                })
                .await
        {
            warn!(device = %handle, managed_set = %set.handle(), error = %e, "Failed to undo leave");
        }
    }

    async fn discard_device(&self, device: &Device) {
        if let Err(e) = self.store.delete(device.handle()).await {
            warn!(device = %device.handle(), error = %e, "Failed to roll back device");
        }
        self.devices.remove(device.handle()).await;
    }

    // ========================================================================
    // Domains
    // ========================================================================

    /// Add a configuration domain to a device.
    pub async fn add_domain(
        &self,
        device: &EntityHandle,
        name: &str,
        auto_sync: bool,
    ) -> Result<Arc<Domain>> {
        let owner = self.device(device).await?;
        let _guard = owner.resource_lock().lock_wait().await;

        for existing in owner.read(|s| s.domains.clone()).await? {
            if self.domain(&existing).await?.read(|d| d.name == name).await? {
                return Err(Error::InvalidRequest(format!(
                    "device '{}' already has domain '{}'",
                    device, name
                )));
            }
        }

        let domain = Domain::create(
            self.store.as_ref(),
            DomainState {
                device: device.clone(),
                name: name.to_string(),
                auto_sync,
                desired_version: None,
                deployed_version: None,
                deployed_checksum: None,
            },
        )
        .await?;
        let domain = self.domains.add(Arc::new(domain)).await?;

        if let Err(e) = owner
            .update(self.store.as_ref(), |s| s.domains.push(domain.handle().clone()))
            .await
        {
            if let Err(rollback) = self.store.delete(domain.handle()).await {
                warn!(domain = %domain.handle(), error = %rollback, "Failed to roll back domain");
            }
            self.domains.remove(domain.handle()).await;
            return Err(e);
        }

        info!(device = %device, domain = %domain.handle(), name = %name, "Domain added");
        Ok(domain)
    }

    /// Store a new configuration version and make it the desired one.
    pub async fn add_domain_version(
        &self,
        handle: &EntityHandle,
        label: &str,
        payload: Vec<u8>,
    ) -> Result<(VersionRecord, RetentionReport)> {
        let domain = self.domain(handle).await?;
        let _guard = domain.resource_lock().lock_wait().await;

        let record = self.store.add_version(handle, label, payload).await?;
        domain
            .update(self.store.as_ref(), |s| s.desired_version = Some(record.version))
            .await?;
        let report = self.trim_domain(&domain).await?;

        debug!(domain = %handle, version = record.version, "Domain version added");
        Ok((record, report))
    }

    /// Configuration versions of a domain, oldest first.
    pub async fn domain_versions(&self, handle: &EntityHandle) -> Result<Vec<VersionRecord>> {
        self.domain(handle).await?;
        self.store.list_versions(handle).await
    }

    pub(crate) async fn trim_domain(&self, domain: &Domain) -> Result<RetentionReport> {
        let in_use = domain
            .read(|s| [s.deployed_version, s.desired_version])
            .await?;
        let history = VersionHistory::new(
            domain.handle().clone(),
            "domain",
            self.store.clone(),
            in_use.into_iter().flatten(),
        );
        trim_versions(&history, self.settings.max_versions_to_store).await
    }

    // ========================================================================
    // Firmware
    // ========================================================================

    /// Store a firmware image for a device model.
    pub async fn add_firmware_version(
        &self,
        model: &str,
        level: &str,
        image: Vec<u8>,
    ) -> Result<(VersionRecord, RetentionReport)> {
        let firmware = self.firmware_line(model).await?;
        let _guard = firmware.resource_lock().lock_wait().await;

        let record = self
            .store
            .add_version(firmware.handle(), level, image)
            .await?;
        let report = self.trim_firmware(&firmware).await?;

        info!(model = %model, level = %level, version = record.version, "Firmware version added");
        Ok((record, report))
    }

    /// Firmware images of a device model, oldest first.
    pub async fn firmware_versions(&self, model: &str) -> Result<Vec<VersionRecord>> {
        match self.firmware_for_model(model).await {
            Some(firmware) => self.store.list_versions(firmware.handle()).await,
            None => Ok(Vec::new()),
        }
    }

    async fn firmware_line(&self, model: &str) -> Result<Arc<Firmware>> {
        let _guard = self.lock.lock_wait().await;
        if let Some(firmware) = self.firmware_for_model(model).await {
            return Ok(firmware);
        }
        let firmware = Firmware::create(
            self.store.as_ref(),
            FirmwareState {
                model: model.to_string(),
            },
        )
        .await?;
        self.firmware.add(Arc::new(firmware)).await
    }

    /// Trim a firmware line. A version is in use while a device of the model
    /// has it deployed.
    pub(crate) async fn trim_firmware(&self, firmware: &Firmware) -> Result<RetentionReport> {
        let model = firmware.read(|f| f.model.clone()).await?;
        let mut in_use = Vec::new();
        for device in self.devices.live_objects().await {
            if let Ok(Some(version)) = device
                .read(|s| (s.model == model).then_some(s.deployed_firmware).flatten())
                .await
            {
                in_use.push(version);
            }
        }
        let history = VersionHistory::new(
            firmware.handle().clone(),
            format!("firmware {}", model),
            self.store.clone(),
            in_use,
        );
        trim_versions(&history, self.settings.max_versions_to_store).await
    }

    // ========================================================================
    // Backups
    // ========================================================================

    /// Backups of a device, oldest first.
    pub async fn backups(&self, handle: &EntityHandle) -> Result<Vec<VersionRecord>> {
        self.device(handle).await?;
        self.store.list_versions(handle).await
    }

    pub(crate) async fn trim_backups(&self, device: &Device) -> Result<RetentionReport> {
        let history = VersionHistory::new(
            device.handle().clone(),
            "backups of",
            self.store.clone(),
            std::iter::empty::<u32>(),
        );
        trim_versions(&history, self.settings.max_versions_to_store).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load every stored entity and queue a resubscribe for each device
    /// that wants a subscription.
    ///
    /// The returned macro container groups the resubscribe tasks and is
    /// marked complete once all of them have finished.
    pub async fn load_all(self: &Arc<Self>) -> Result<Arc<MacroProgressContainer>> {
        let progress = MacroProgressContainer::new("load fleet");

        for record in self.store.list(EntityKind::ManagedSet).await? {
            let handle = record.handle.clone();
            let set = self
                .managed_sets
                .get_or_load(&handle, || async move { Entity::from_record(record).map(Some) })
                .await?;
            self.ensure_set_area(&set).await?;
        }
        for record in self.store.list(EntityKind::Firmware).await? {
            let handle = record.handle.clone();
            self.firmware
                .get_or_load(&handle, || async move { Entity::from_record(record).map(Some) })
                .await?;
        }
        for record in self.store.list(EntityKind::Device).await? {
            let handle = record.handle.clone();
            self.devices
                .get_or_load(&handle, || async move { Entity::from_record(record).map(Some) })
                .await?;
        }
        for record in self.store.list(EntityKind::Domain).await? {
            let handle = record.handle.clone();
            let domain = match self
                .domains
                .get_or_load(&handle, || async move { Entity::from_record(record).map(Some) })
                .await
            {
                Err(e) if e.is_deleted() => continue,
                loaded => loaded?,
            };
            let owner = domain.read(|d| d.device.clone()).await?;
            if !self.devices.contains(&owner).await {
                warn!(domain = %handle, device = %owner, "Dropping domain of a removed device");
                self.domains.remove(&handle).await;
                if let Err(e) = self.store.delete(&handle).await {
                    warn!(domain = %handle, error = %e, "Failed to delete orphaned domain");
                }
            }
        }

        for device in self.devices.live_objects().await {
            if !device.read(|s| s.subscribed).await? {
                continue;
            }
            let area = self.work_area_for(&device).await?;
            let task = self
                .device_task("subscribe", &device, Vec::new(), |manager, device, _| async move {
                    manager.subscribe_device(&device).await
                })
                .with_origin(TaskOrigin::System);
            progress.add_child(self.processor.privileged_enqueue(task, &area).await);
        }

        info!(
            managed_sets = self.managed_sets.len().await,
            devices = self.devices.len().await,
            domains = self.domains.len().await,
            resubscribing = progress.child_count(),
            "Fleet loaded"
        );

        let group = progress.clone();
        tokio::spawn(async move {
            group.wait_children().await;
            group.mark_complete();
        });
        Ok(progress)
    }

    /// Queue an unsubscribe for every subscribed device, bypassing capacity
    /// and shutdown checks. The desired subscription flag is kept so the
    /// next start resubscribes.
    pub async fn unsubscribe_all(self: &Arc<Self>) -> Arc<MacroProgressContainer> {
        let progress = MacroProgressContainer::new("unsubscribe fleet");
        for device in self.devices.live_objects().await {
            let Ok((subscribed, address)) =
                device.read(|s| (s.subscribed, s.address.clone())).await
            else {
                continue;
            };
            if !subscribed {
                continue;
            }
            let Ok(area) = self.work_area_for(&device).await else {
                continue;
            };
            let task = self
                .device_task("unsubscribe", &device, Vec::new(), move |manager, _, _| async move {
                    manager.protocol.unsubscribe(&address).await?;
                    Ok(None)
                })
                .with_origin(TaskOrigin::System);
            progress.add_child(self.processor.privileged_enqueue(task, &area).await);
        }

        let group = progress.clone();
        tokio::spawn(async move {
            group.wait_children().await;
            group.mark_complete();
        });
        progress
    }

    /// Stop accepting work, unsubscribe the fleet and drain every work area.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Fleet manager shutting down");
        self.processor.begin_shutdown().await;
        let unsubscribed = self.unsubscribe_all().await;
        self.processor.shutdown().await;

        let failed = unsubscribed.failed_children().len();
        if failed > 0 {
            warn!(failed, "Some devices could not be unsubscribed");
        }
        info!(
            unsubscribed = unsubscribed.child_count() - failed,
            "Fleet manager stopped"
        );
    }

    /// Counts of live entities and work area statistics.
    pub async fn status(&self) -> FleetStatus {
        FleetStatus {
            accepting: self.processor.is_accepting(),
            devices: self.devices.len().await,
            managed_sets: self.managed_sets.len().await,
            domains: self.domains.len().await,
            firmware_lines: self.firmware.len().await,
            work_areas: self.processor.stats().await,
        }
    }
}
