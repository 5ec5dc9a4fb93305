// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity map from durable entity handles to live in-memory objects.
//!
//! The mapper guarantees at most one live object per handle. Each object
//! carries a [`Liveness`] token shared with the mapper; removing the handle
//! flips the token so every accessor on a previously obtained reference fails
//! with [`Error::Deleted`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque durable identity of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityHandle(String);

impl EntityHandle {
    /// Wrap an existing handle string.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Allocate a fresh random handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The handle as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Liveness token of a live object.
///
/// Clones share the same flag. Only the mapper clears it.
#[derive(Debug, Clone)]
pub struct Liveness {
    handle: EntityHandle,
    deleted: Arc<AtomicBool>,
}

impl Liveness {
    /// Token for a new, live object.
    pub fn new(handle: EntityHandle) -> Self {
        Self {
            handle,
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle of the object this token belongs to.
    pub fn handle(&self) -> &EntityHandle {
        &self.handle
    }

    /// Whether the object has been removed.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Fail with [`Error::Deleted`] once the object has been removed.
    pub fn check(&self) -> Result<()> {
        if self.is_deleted() {
            Err(Error::Deleted {
                handle: self.handle.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }
}

/// Objects managed by a [`PersistenceMapper`].
pub trait Persistable: Send + Sync {
    /// The object's liveness token.
    fn liveness(&self) -> &Liveness;

    /// The object's durable handle.
    fn handle(&self) -> &EntityHandle {
        self.liveness().handle()
    }
}

/// Identity map for one entity type.
pub struct PersistenceMapper<T: Persistable> {
    entries: RwLock<HashMap<EntityHandle, Arc<T>>>,
    tombstones: RwLock<HashSet<EntityHandle>>,
    load_lock: Mutex<()>,
}

impl<T: Persistable> Default for PersistenceMapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Persistable> fmt::Debug for PersistenceMapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceMapper").finish_non_exhaustive()
    }
}

impl<T: Persistable> PersistenceMapper<T> {
    /// Create an empty mapper.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashSet::new()),
            load_lock: Mutex::new(()),
        }
    }

    /// Register a live object under its handle.
    ///
    /// Fails with [`Error::AlreadyRegistered`] if the handle is live, or
    /// [`Error::Deleted`] if it was removed before.
    pub async fn add(&self, object: Arc<T>) -> Result<Arc<T>> {
        let handle = object.handle().clone();
        if self.tombstones.read().await.contains(&handle) {
            return Err(Error::Deleted {
                handle: handle.to_string(),
            });
        }
        let mut entries = self.entries.write().await;
        if entries.contains_key(&handle) {
            return Err(Error::AlreadyRegistered {
                handle: handle.to_string(),
            });
        }
        entries.insert(handle.clone(), object.clone());
        debug!(handle = %handle, "Entity registered");
        Ok(object)
    }

    /// The live object for `handle`, or [`Error::Deleted`] if it was removed
    /// or never registered.
    pub async fn get_via(&self, handle: &EntityHandle) -> Result<Arc<T>> {
        self.entries
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::Deleted {
                handle: handle.to_string(),
            })
    }

    /// The live object for `handle`, materialising it with `loader` if it is
    /// not registered yet.
    ///
    /// Concurrent callers for the same handle observe the same object. A
    /// loader returning `None` (not in durable storage) yields
    /// [`Error::Deleted`]. Removed handles are never reloaded.
    pub async fn get_or_load<F, Fut>(&self, handle: &EntityHandle, loader: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(object) = self.entries.read().await.get(handle) {
            return Ok(object.clone());
        }
        let _loading = self.load_lock.lock().await;
        if let Some(object) = self.entries.read().await.get(handle) {
            return Ok(object.clone());
        }
        if self.tombstones.read().await.contains(handle) {
            return Err(Error::Deleted {
                handle: handle.to_string(),
            });
        }

        let object = loader().await?.ok_or_else(|| Error::Deleted {
            handle: handle.to_string(),
        })?;
        if object.handle() != handle {
            return Err(Error::InvalidRequest(format!(
                "loader for '{}' returned entity '{}'",
                handle,
                object.handle()
            )));
        }
        let object = Arc::new(object);
        self.entries
            .write()
            .await
            .insert(handle.clone(), object.clone());
        debug!(handle = %handle, "Entity loaded");
        Ok(object)
    }

    /// Sever the mapping and clear the object's liveness.
    ///
    /// Returns the removed object, or `None` if the handle was not live.
    pub async fn remove(&self, handle: &EntityHandle) -> Option<Arc<T>> {
        let removed = self.entries.write().await.remove(handle);
        self.tombstones.write().await.insert(handle.clone());
        if let Some(object) = &removed {
            object.liveness().mark_deleted();
            debug!(handle = %handle, "Entity removed");
        }
        removed
    }

    /// Whether `handle` maps to a live object.
    pub async fn contains(&self, handle: &EntityHandle) -> bool {
        self.entries.read().await.contains_key(handle)
    }

    /// Number of live objects.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when no objects are live.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// All live objects, ordered by handle.
    pub async fn live_objects(&self) -> Vec<Arc<T>> {
        let entries = self.entries.read().await;
        let mut objects: Vec<Arc<T>> = entries.values().cloned().collect();
        objects.sort_by(|a, b| a.handle().cmp(b.handle()));
        objects
    }
}
