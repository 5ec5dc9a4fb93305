// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work areas: serialization domains that each own one task queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::queue::TaskQueue;
use crate::task::TaskSummary;

/// Identity of a work area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum WorkAreaId {
    /// The fleet-wide manager (unmanaged devices and fleet-wide tasks).
    Manager,
    /// One managed set.
    ManagedSet(String),
}

impl WorkAreaId {
    /// Work area of a managed set.
    pub fn managed_set(name: impl Into<String>) -> Self {
        WorkAreaId::ManagedSet(name.into())
    }
}

impl fmt::Display for WorkAreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkAreaId::Manager => write!(f, "manager"),
            WorkAreaId::ManagedSet(name) => write!(f, "managed-set:{}", name),
        }
    }
}

/// Counters for one work area.
#[derive(Debug, Default)]
pub(crate) struct WorkAreaCounters {
    pub(crate) enqueued: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) discarded: AtomicU64,
}

/// Point-in-time statistics of a work area.
#[derive(Debug, Clone, Serialize)]
pub struct WorkAreaStats {
    /// Work area identity.
    pub id: WorkAreaId,
    /// Tasks currently queued.
    pub queued: usize,
    /// Task currently executing.
    pub current: Option<TaskSummary>,
    /// Tasks accepted into the queue.
    pub enqueued: u64,
    /// Tasks rejected because the queue was full.
    pub rejected: u64,
    /// Tasks that finished successfully.
    pub completed: u64,
    /// Tasks that finished with an error.
    pub failed: u64,
    /// Tasks discarded at shutdown.
    pub discarded: u64,
}

#[derive(Debug)]
pub(crate) struct WorkAreaState {
    pub(crate) queue: TaskQueue,
    /// Set once the area stops accepting ordinary tasks.
    pub(crate) closing: bool,
    /// Whether a worker loop is alive for this area.
    pub(crate) worker_running: bool,
    pub(crate) workers: Vec<JoinHandle<()>>,
    pub(crate) current: Option<TaskSummary>,
}

/// A serialization domain owning exactly one [`TaskQueue`].
///
/// Work areas are created through
/// [`QueueProcessor::register_work_area`](crate::processor::QueueProcessor::register_work_area).
#[derive(Debug)]
pub struct WorkArea {
    id: WorkAreaId,
    pub(crate) state: Mutex<WorkAreaState>,
    pub(crate) notify: Notify,
    pub(crate) counters: WorkAreaCounters,
}

impl WorkArea {
    pub(crate) fn new(id: WorkAreaId, capacity: Option<usize>) -> Self {
        let queue = TaskQueue::new(id.to_string(), capacity);
        Self {
            id,
            state: Mutex::new(WorkAreaState {
                queue,
                closing: false,
                worker_running: false,
                workers: Vec::new(),
                current: None,
            }),
            notify: Notify::new(),
            counters: WorkAreaCounters::default(),
        }
    }

    /// Work area identity.
    pub fn id(&self) -> &WorkAreaId {
        &self.id
    }

    /// Number of queued (not yet executing) tasks.
    pub async fn size(&self) -> usize {
        self.state.lock().await.queue.size()
    }

    /// Inspect the `i`-th queued task without removing it.
    pub async fn peek(&self, i: usize) -> Option<TaskSummary> {
        self.state.lock().await.queue.peek(i)
    }

    /// The task currently executing, if any.
    pub async fn current_task(&self) -> Option<TaskSummary> {
        self.state.lock().await.current.clone()
    }

    /// Whether the area has stopped accepting ordinary tasks.
    pub async fn is_closing(&self) -> bool {
        self.state.lock().await.closing
    }

    /// Statistics snapshot.
    pub async fn stats(&self) -> WorkAreaStats {
        let state = self.state.lock().await;
        WorkAreaStats {
            id: self.id.clone(),
            queued: state.queue.size(),
            current: state.current.clone(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}
