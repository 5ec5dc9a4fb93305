// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Device operations.
//!
//! Each public operation validates its arguments in the foreground, then
//! queues a background task to the device's work area and returns the task's
//! progress container. The task takes the device lock (plus the domain lock
//! for domain deploys) before touching the device, and re-checks that the
//! device still exists.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use fleetward_core::{
    BackgroundTask, EntityHandle, Error, Lockable, Persistable, ProgressContainer, ResourceLock,
    Result, lock_ordered,
};
use serde_json::{Value, json};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::manager::FleetManager;
use crate::model::{Device, Domain, OperationalStatus};
use crate::protocol::{ChangeRequest, ProbeReport};
use crate::store::VersionRecord;

impl FleetManager {
    // ========================================================================
    // Public operations
    // ========================================================================

    /// Subscribe to a device's events and record the wish to stay subscribed.
    pub async fn subscribe(
        self: &Arc<Self>,
        device: &EntityHandle,
    ) -> Result<Arc<ProgressContainer>> {
        let device = self.device(device).await?;
        self.submit_subscribe(&device, None).await
    }

    /// Cancel a device's subscription.
    pub async fn unsubscribe(
        self: &Arc<Self>,
        device: &EntityHandle,
    ) -> Result<Arc<ProgressContainer>> {
        let device = self.device(device).await?;
        let task = self.device_task(
            "unsubscribe",
            &device,
            Vec::new(),
            |manager, device, _| async move { manager.unsubscribe_device(&device).await },
        );
        self.submit(&device, task).await
    }

    /// Probe a device and record what it reports.
    pub async fn refresh_device_info(
        self: &Arc<Self>,
        device: &EntityHandle,
    ) -> Result<Arc<ProgressContainer>> {
        let device = self.device(device).await?;
        self.submit_refresh(&device, None).await
    }

    /// Install a stored firmware version on a device.
    ///
    /// The task transfers the image, polls the device until it is back on the
    /// new level (failing with `Timeout` after the reboot deadline),
    /// resubscribes it and trims the firmware line.
    pub async fn push_firmware(
        self: &Arc<Self>,
        device: &EntityHandle,
        version: u32,
    ) -> Result<Arc<ProgressContainer>> {
        let device = self.device(device).await?;
        let model = device.read(|s| s.model.clone()).await?;
        let firmware = self.firmware_for_model(&model).await.ok_or_else(|| {
            Error::InvalidRequest(format!("no firmware stored for model '{}'", model))
        })?;
        let image = self
            .store
            .get_version(firmware.handle(), version)
            .await?
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "firmware version {} not found for model '{}'",
                    version, model
                ))
            })?;

        let task = self.device_task(
            "push-firmware",
            &device,
            Vec::new(),
            move |manager, device, progress| async move {
                manager.push_firmware_to(&device, image, &progress).await
            },
        );
        self.submit(&device, task).await
    }

    /// Deploy a configuration version (default: the desired one) of a domain.
    pub async fn deploy_domain(
        self: &Arc<Self>,
        domain: &EntityHandle,
        version: Option<u32>,
    ) -> Result<Arc<ProgressContainer>> {
        let domain = self.domain(domain).await?;
        self.submit_deploy(&domain, version, None).await
    }

    /// Export a device's configuration into its backup history.
    pub async fn backup(
        self: &Arc<Self>,
        device: &EntityHandle,
    ) -> Result<Arc<ProgressContainer>> {
        let device = self.device(device).await?;
        let task = self.device_task(
            "backup",
            &device,
            Vec::new(),
            |manager, device, _| async move { manager.backup_device(&device).await },
        );
        self.submit(&device, task).await
    }

    /// Restore a backup (default: the latest) onto a device.
    pub async fn restore(
        self: &Arc<Self>,
        device: &EntityHandle,
        version: Option<u32>,
    ) -> Result<Arc<ProgressContainer>> {
        let device = self.device(device).await?;
        let backups = self.store.list_versions(device.handle()).await?;
        let backup = match version {
            Some(v) => backups.into_iter().find(|b| b.version == v),
            None => backups.into_iter().last(),
        }
        .ok_or_else(|| {
            Error::InvalidRequest(format!(
                "no matching backup for device '{}'",
                device.handle()
            ))
        })?;

        let task = self.device_task(
            "restore",
            &device,
            Vec::new(),
            move |manager, device, _| async move {
                let address = device.read(|s| s.address.clone()).await?;
                manager
                    .protocol
                    .apply(
                        &address,
                        ChangeRequest::Restore {
                            payload: backup.payload,
                        },
                    )
                    .await?;
                info!(device = %device.handle(), version = backup.version, "Backup restored");
                Ok(Some(json!({ "version": backup.version })))
            },
        );
        self.submit(&device, task).await
    }

    /// Stop a device taking traffic.
    pub async fn quiesce(
        self: &Arc<Self>,
        device: &EntityHandle,
    ) -> Result<Arc<ProgressContainer>> {
        self.submit_quiesce(device, true).await
    }

    /// Let a quiesced device take traffic again.
    pub async fn unquiesce(
        self: &Arc<Self>,
        device: &EntityHandle,
    ) -> Result<Arc<ProgressContainer>> {
        self.submit_quiesce(device, false).await
    }

    // ========================================================================
    // Task construction
    // ========================================================================

    /// Build a task that runs `f` while holding the device lock and `extra`
    /// locks, acquired in rank order.
    pub(crate) fn device_task<F, Fut>(
        self: &Arc<Self>,
        kind: &str,
        device: &Arc<Device>,
        extra: Vec<ResourceLock>,
        f: F,
    ) -> BackgroundTask
    where
        F: FnOnce(Arc<FleetManager>, Arc<Device>, Arc<ProgressContainer>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let manager = self.clone();
        let device = device.clone();
        let targets: Vec<String> = extra.iter().map(|l| l.resource().to_string()).collect();
        let target = device.handle().to_string();
        let mut task = BackgroundTask::from_fn(kind, target, move |progress| async move {
            let mut locks: Vec<&ResourceLock> = vec![device.resource_lock()];
            locks.extend(extra.iter());
            let _guards = lock_ordered(&locks).await;
            device.liveness().check()?;
            f(manager, device.clone(), progress).await
        });
        for target in targets {
            task = task.with_target(target);
        }
        task
    }

    async fn submit(
        &self,
        device: &Device,
        task: BackgroundTask,
    ) -> Result<Arc<ProgressContainer>> {
        let area = self.work_area_for(device).await?;
        self.processor.enqueue(task, &area).await
    }

    pub(crate) async fn submit_subscribe(
        self: &Arc<Self>,
        device: &Arc<Device>,
        attempt: Option<u32>,
    ) -> Result<Arc<ProgressContainer>> {
        let task = self.device_task(
            "subscribe",
            device,
            Vec::new(),
            |manager, device, _| async move { manager.subscribe_device(&device).await },
        );
        let task = match attempt {
            Some(n) => task.with_attempt(n),
            None => task,
        };
        self.submit(device, task).await
    }

    pub(crate) async fn submit_refresh(
        self: &Arc<Self>,
        device: &Arc<Device>,
        attempt: Option<u32>,
    ) -> Result<Arc<ProgressContainer>> {
        let task = self.device_task(
            "refresh-device-info",
            device,
            Vec::new(),
            |manager, device, _| async move { manager.refresh_device(&device).await },
        );
        let task = match attempt {
            Some(n) => task.with_attempt(n),
            None => task,
        };
        self.submit(device, task).await
    }

    pub(crate) async fn submit_deploy(
        self: &Arc<Self>,
        domain: &Arc<Domain>,
        version: Option<u32>,
        attempt: Option<u32>,
    ) -> Result<Arc<ProgressContainer>> {
        let state = domain.snapshot().await?;
        let version = version.or(state.desired_version).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "domain '{}' has no version to deploy",
                domain.handle()
            ))
        })?;
        let record = self
            .store
            .get_version(domain.handle(), version)
            .await?
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "version {} not found for domain '{}'",
                    version,
                    domain.handle()
                ))
            })?;
        let device = self.device(&state.device).await?;

        let locks = vec![domain.resource_lock().clone()];
        let domain = domain.clone();
        let task = self.device_task(
            "deploy-domain",
            &device,
            locks,
            move |manager, device, _| async move {
                manager.deploy_to(&device, &domain, record).await
            },
        );
        let task = match attempt {
            Some(n) => task.with_attempt(n),
            None => task,
        };
        self.submit(&device, task).await
    }

    async fn submit_quiesce(
        self: &Arc<Self>,
        device: &EntityHandle,
        quiesce: bool,
    ) -> Result<Arc<ProgressContainer>> {
        let device = self.device(device).await?;
        let kind = if quiesce { "quiesce" } else { "unquiesce" };
        let task = self.device_task(
            kind,
            &device,
            Vec::new(),
            move |manager, device, _| async move { manager.set_quiesced(&device, quiesce).await },
        );
        self.submit(&device, task).await
    }

    // ========================================================================
    // Task bodies (caller holds the device lock)
    // ========================================================================

    pub(crate) async fn subscribe_device(&self, device: &Device) -> Result<Option<Value>> {
        let address = device.read(|s| s.address.clone()).await?;
        self.protocol.subscribe(&address).await?;
        device
            .update(self.store.as_ref(), |s| {
                s.subscribed = true;
                if s.status != OperationalStatus::Quiesced {
                    s.status = OperationalStatus::Up;
                }
            })
            .await?;
        debug!(device = %device.handle(), "Device subscribed");
        Ok(None)
    }

    async fn unsubscribe_device(&self, device: &Device) -> Result<Option<Value>> {
        let address = device.read(|s| s.address.clone()).await?;
        self.protocol.unsubscribe(&address).await?;
        device
            .update(self.store.as_ref(), |s| s.subscribed = false)
            .await?;
        debug!(device = %device.handle(), "Device unsubscribed");
        Ok(None)
    }

    async fn refresh_device(&self, device: &Device) -> Result<Option<Value>> {
        let address = device.read(|s| s.address.clone()).await?;
        let report = self.protocol.probe(&address).await?;
        self.record_probe(device, &report).await?;
        if !report.reachable {
            return Err(Error::protocol(address, "device unreachable"));
        }
        Ok(Some(serde_json::to_value(&report)?))
    }

    /// Copy a probe report into the device's state.
    pub(crate) async fn record_probe(&self, device: &Device, report: &ProbeReport) -> Result<()> {
        device
            .update(self.store.as_ref(), |s| {
                if !report.reachable {
                    s.status = OperationalStatus::Unreachable;
                    return;
                }
                if report.firmware_level.is_some() {
                    s.firmware_level = report.firmware_level.clone();
                }
                s.quiesced = report.quiesced;
                s.status = if report.quiesced {
                    OperationalStatus::Quiesced
                } else {
                    OperationalStatus::Up
                };
            })
            .await
    }

    async fn push_firmware_to(
        &self,
        device: &Device,
        image: VersionRecord,
        progress: &ProgressContainer,
    ) -> Result<Option<Value>> {
        let (address, model, subscribed) = device
            .read(|s| (s.address.clone(), s.model.clone(), s.subscribed))
            .await?;
        let level = image.label.clone();
        progress.set_total_steps(4);

        progress.increment_current_step(1, "transfer image");
        info!(device = %device.handle(), level = %level, "Pushing firmware");
        self.protocol
            .apply(
                &address,
                ChangeRequest::Firmware {
                    level: level.clone(),
                    image: image.payload,
                },
            )
            .await?;

        progress.increment_current_step(1, "wait for reboot");
        let report = match self.wait_for_level(&address, &level).await {
            Ok(report) => report,
            Err(e) => {
                device
                    .update(self.store.as_ref(), |s| {
                        s.status = OperationalStatus::Unreachable
                    })
                    .await?;
                return Err(e);
            }
        };

        progress.increment_current_step(1, "resubscribe");
        if subscribed {
            self.protocol.subscribe(&address).await?;
        }

        progress.increment_current_step(1, "record");
        device
            .update(self.store.as_ref(), |s| s.deployed_firmware = Some(image.version))
            .await?;
        self.record_probe(device, &report).await?;

        if let Some(firmware) = self.firmware_for_model(&model).await {
            let _guard = firmware.resource_lock().lock_wait().await;
            if let Err(e) = self.trim_firmware(&firmware).await {
                warn!(model = %model, error = %e, "Failed to trim firmware versions");
            }
        }

        info!(device = %device.handle(), level = %level, "Firmware installed");
        Ok(Some(json!({ "level": level, "version": image.version })))
    }

    /// Poll until the device answers on `level`, or the reboot deadline
    /// passes.
    async fn wait_for_level(&self, address: &str, level: &str) -> Result<ProbeReport> {
        let deadline = Instant::now() + self.settings.firmware_reboot_timeout;
        loop {
            match self.protocol.probe(address).await {
                Ok(report) if report.reachable => {
                    if report.firmware_level.as_deref() == Some(level) {
                        return Ok(report);
                    }
                    return Err(Error::protocol(
                        address,
                        format!(
                            "device came back on level {:?}, expected {}",
                            report.firmware_level, level
                        ),
                    ));
                }
                Ok(_) => debug!(address = %address, "Device still rebooting"),
                Err(e) => debug!(address = %address, error = %e, "Probe failed while rebooting"),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("{} to come back on firmware {}", address, level),
                    seconds: self.settings.firmware_reboot_timeout.as_secs(),
                });
            }
            sleep(self.settings.reboot_poll_interval).await;
        }
    }

    async fn deploy_to(
        &self,
        device: &Device,
        domain: &Domain,
        record: VersionRecord,
    ) -> Result<Option<Value>> {
        let name = domain.read(|d| d.name.clone()).await?;
        let address = device.read(|s| s.address.clone()).await?;

        self.protocol
            .apply(
                &address,
                ChangeRequest::Domain {
                    name: name.clone(),
                    payload: record.payload,
                },
            )
            .await?;
        domain
            .update(self.store.as_ref(), |d| {
                d.deployed_version = Some(record.version);
                d.deployed_checksum = Some(record.checksum.clone());
                d.desired_version = Some(record.version);
            })
            .await?;

        if let Err(e) = self.trim_domain(domain).await {
            warn!(domain = %domain.handle(), error = %e, "Failed to trim domain versions");
        }
        info!(
            device = %device.handle(),
            domain = %name,
            version = record.version,
            "Domain deployed"
        );
        Ok(Some(json!({
            "version": record.version,
            "checksum": record.checksum,
        })))
    }

    async fn backup_device(&self, device: &Device) -> Result<Option<Value>> {
        let address = device.read(|s| s.address.clone()).await?;
        let payload = self
            .protocol
            .apply(&address, ChangeRequest::Backup)
            .await?
            .payload
            .ok_or_else(|| Error::protocol(&address, "device returned no backup"))?;

        let label = Utc::now().to_rfc3339();
        let record = self
            .store
            .add_version(device.handle(), &label, payload)
            .await?;
        if let Err(e) = self.trim_backups(device).await {
            warn!(device = %device.handle(), error = %e, "Failed to trim backups");
        }

        info!(device = %device.handle(), version = record.version, "Backup stored");
        Ok(Some(json!({
            "version": record.version,
            "checksum": record.checksum,
        })))
    }

    async fn set_quiesced(&self, device: &Device, quiesce: bool) -> Result<Option<Value>> {
        let address = device.read(|s| s.address.clone()).await?;
        let (change, what) = if quiesce {
            (ChangeRequest::Quiesce, "quiesce")
        } else {
            (ChangeRequest::Unquiesce, "unquiesce")
        };

        let limit = self.settings.quiesce_timeout;
        timeout(limit, self.protocol.apply(&address, change))
            .await
            .map_err(|_| Error::Timeout {
                what: format!("{} of {}", what, address),
                seconds: limit.as_secs(),
            })??;

        device
            .update(self.store.as_ref(), |s| {
                s.quiesced = quiesce;
                s.status = if quiesce {
                    OperationalStatus::Quiesced
                } else {
                    OperationalStatus::Up
                };
            })
            .await?;
        info!(device = %device.handle(), quiesced = quiesce, "Quiesce state changed");
        Ok(None)
    }
}
