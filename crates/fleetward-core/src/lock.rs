// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-resource exclusive locks.
//!
//! A [`ResourceLock`] guards one managed resource (the manager's unmanaged
//! device list, a managed set, a device, a domain). It is used for state that
//! is touched outside the single-task-per-work-area guarantee of the
//! scheduler, and for multi-step operations spanning several resources.
//!
//! Locks are not reentrant: acquiring a lock that the same logical path
//! already holds deadlocks (`lock_wait`) or fails with `Busy`
//! (`lock_no_wait`).
//!
//! # Lock ordering
//!
//! Every lock carries a [`LockRank`]. When a path needs more than one lock it
//! must acquire them coarse-to-fine: manager, then managed set, then device,
//! then domain, then firmware line. [`lock_ordered`] does this for a set of locks, breaking ties
//! by resource identity.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};

/// Position of a lock in the global acquisition order. Lower ranks are
/// acquired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// The fleet manager itself (guards the unmanaged device list).
    Manager = 0,
    /// A managed set.
    ManagedSet = 1,
    /// A single device.
    Device = 2,
    /// A configuration domain on a device.
    Domain = 3,
    /// Firmware images of one device model. Taken after the device lock when
    /// a push trims the line.
    Firmware = 4,
}

/// Exclusive lock bound to one resource identity.
///
/// Cloning a `ResourceLock` yields another handle to the same lock.
#[derive(Clone)]
pub struct ResourceLock {
    resource: Arc<str>,
    rank: LockRank,
    inner: Arc<Mutex<()>>,
}

impl fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("resource", &self.resource)
            .field("rank", &self.rank)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl ResourceLock {
    /// Create an unlocked lock for `resource`.
    pub fn new(resource: impl Into<String>, rank: LockRank) -> Self {
        let resource: String = resource.into();
        Self {
            resource: Arc::from(resource),
            rank,
            inner: Arc::new(Mutex::new(())),
        }
    }

    /// Identity of the guarded resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Rank of this lock in the acquisition order.
    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Block until the lock is acquired. There is no timeout; callers that
    /// need a bounded wait should retry [`lock_no_wait`](Self::lock_no_wait).
    pub async fn lock_wait(&self) -> LockGuard {
        if self.is_locked() {
            debug!(resource = %self.resource, "Waiting for held lock");
        }
        let guard = self.inner.clone().lock_owned().await;
        LockGuard {
            resource: self.resource.clone(),
            _guard: guard,
        }
    }

    /// Acquire the lock or fail immediately with [`Error::Busy`].
    pub fn lock_no_wait(&self) -> Result<LockGuard> {
        match self.inner.clone().try_lock_owned() {
            Ok(guard) => Ok(LockGuard {
                resource: self.resource.clone(),
                _guard: guard,
            }),
            Err(_) => Err(Error::Busy {
                resource: self.resource.to_string(),
            }),
        }
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    fn same_lock(&self, other: &ResourceLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Proof of holding a [`ResourceLock`]. The lock is released when the guard
/// is dropped or [`unlock`](Self::unlock)ed.
///
/// Only the holder owns a guard, so releasing a lock one does not hold cannot
/// be expressed.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    resource: Arc<str>,
    _guard: OwnedMutexGuard<()>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .finish()
    }
}

impl LockGuard {
    /// Identity of the resource this guard holds.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Release the lock.
    pub fn unlock(self) {
        drop(self);
    }
}

/// Entities that own a [`ResourceLock`].
pub trait Lockable {
    /// The entity's lock.
    fn resource_lock(&self) -> &ResourceLock;
}

/// Acquire several locks in (rank, identity) order.
///
/// Duplicate handles to the same lock are acquired once. Guards are returned
/// in acquisition order; dropping the vector releases them front to back.
pub async fn lock_ordered(locks: &[&ResourceLock]) -> Vec<LockGuard> {
    let mut ordered: Vec<&ResourceLock> = Vec::with_capacity(locks.len());
    for lock in locks {
        if !ordered.iter().any(|l| l.same_lock(lock)) {
            ordered.push(lock);
        }
    }
    ordered.sort_by(|a, b| {
        a.rank
            .cmp(&b.rank)
            .then_with(|| a.resource.cmp(&b.resource))
    });

    let mut guards = Vec::with_capacity(ordered.len());
    for lock in ordered {
        guards.push(lock.lock_wait().await);
    }
    guards
}
