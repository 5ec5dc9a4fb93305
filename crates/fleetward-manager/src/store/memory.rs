// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for tests and embedded use.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use fleetward_core::{EntityHandle, Error, Result};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{EntityKind, EntityRecord, Store, VersionRecord, checksum};

#[derive(Debug)]
struct StoredEntity {
    record: EntityRecord,
    seq: u64,
    version_seq: u32,
    versions: BTreeMap<u32, VersionRecord>,
}

/// Store keeping everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<EntityHandle, StoredEntity>>,
    next_seq: AtomicU64,
    unavailable: AtomicBool,
    fail_countdown: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every call fails with `StoreFailure`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the `n`-th call from now fail with `StoreFailure` (1 is the next
    /// call). Calls before and after it succeed. `0` disarms.
    pub fn fail_call(&self, n: usize) {
        self.fail_countdown.store(n, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::store(operation, "store unavailable"));
        }
        let fire = self
            .fail_countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|n| n == 1);
        if fire {
            return Err(Error::store(operation, "injected failure"));
        }
        Ok(())
    }
}

fn deleted(handle: &EntityHandle) -> Error {
    Error::Deleted {
        handle: handle.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, kind: EntityKind, body: Value) -> Result<EntityRecord> {
        self.check("create")?;
        let now = Utc::now();
        let record = EntityRecord {
            handle: EntityHandle::generate(),
            kind,
            revision: 1,
            body,
            created_at: now,
            updated_at: now,
        };
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.entities.write().await.insert(
            record.handle.clone(),
            StoredEntity {
                record: record.clone(),
                seq,
                version_seq: 0,
                versions: BTreeMap::new(),
            },
        );
        Ok(record)
    }

    async fn get(&self, handle: &EntityHandle) -> Result<Option<EntityRecord>> {
        self.check("get")?;
        Ok(self
            .entities
            .read()
            .await
            .get(handle)
            .map(|e| e.record.clone()))
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        self.check("list")?;
        let entities = self.entities.read().await;
        let mut matching: Vec<&StoredEntity> = entities
            .values()
            .filter(|e| e.record.kind == kind)
            .collect();
        matching.sort_by_key(|e| e.seq);
        Ok(matching.into_iter().map(|e| e.record.clone()).collect())
    }

    async fn save(
        &self,
        handle: &EntityHandle,
        expected_revision: i64,
        body: Value,
    ) -> Result<i64> {
        self.check("save")?;
        let mut entities = self.entities.write().await;
        let entry = entities.get_mut(handle).ok_or_else(|| deleted(handle))?;
        if entry.record.revision != expected_revision {
            return Err(Error::Conflict {
                handle: handle.to_string(),
                expected: expected_revision,
                actual: entry.record.revision,
            });
        }
        entry.record.revision += 1;
        entry.record.body = body;
        entry.record.updated_at = Utc::now();
        Ok(entry.record.revision)
    }

    async fn save_forced(&self, handle: &EntityHandle, body: Value) -> Result<i64> {
        self.check("save_forced")?;
        let mut entities = self.entities.write().await;
        let entry = entities.get_mut(handle).ok_or_else(|| deleted(handle))?;
        entry.record.revision += 1;
        entry.record.body = body;
        entry.record.updated_at = Utc::now();
        Ok(entry.record.revision)
    }

    async fn delete(&self, handle: &EntityHandle) -> Result<bool> {
        self.check("delete")?;
        Ok(self.entities.write().await.remove(handle).is_some())
    }

    async fn add_version(
        &self,
        owner: &EntityHandle,
        label: &str,
        payload: Vec<u8>,
    ) -> Result<VersionRecord> {
        self.check("add_version")?;
        let mut entities = self.entities.write().await;
        let entry = entities.get_mut(owner).ok_or_else(|| deleted(owner))?;
        entry.version_seq += 1;
        let record = VersionRecord {
            owner: owner.clone(),
            version: entry.version_seq,
            label: label.to_string(),
            checksum: checksum(&payload),
            payload,
            created_at: Utc::now(),
        };
        entry.versions.insert(record.version, record.clone());
        Ok(record)
    }

    async fn list_versions(&self, owner: &EntityHandle) -> Result<Vec<VersionRecord>> {
        self.check("list_versions")?;
        let entities = self.entities.read().await;
        let entry = entities.get(owner).ok_or_else(|| deleted(owner))?;
        Ok(entry.versions.values().cloned().collect())
    }

    async fn get_version(
        &self,
        owner: &EntityHandle,
        version: u32,
    ) -> Result<Option<VersionRecord>> {
        self.check("get_version")?;
        let entities = self.entities.read().await;
        let entry = entities.get(owner).ok_or_else(|| deleted(owner))?;
        Ok(entry.versions.get(&version).cloned())
    }

    async fn delete_version(&self, owner: &EntityHandle, version: u32) -> Result<bool> {
        self.check("delete_version")?;
        let mut entities = self.entities.write().await;
        let entry = entities.get_mut(owner).ok_or_else(|| deleted(owner))?;
        Ok(entry.versions.remove(&version).is_some())
    }
}
