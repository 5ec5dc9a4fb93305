// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FIFO task queue owned by one work area.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::task::{BackgroundTask, TaskSummary};

/// A queued task and whether it was enqueued through the privileged path.
#[derive(Debug)]
pub struct QueuedTask {
    /// The task.
    pub task: BackgroundTask,
    /// Privileged tasks bypass capacity and survive shutdown.
    pub privileged: bool,
}

/// Ordered, optionally capacity-bounded holding area for pending tasks.
#[derive(Debug)]
pub struct TaskQueue {
    work_area: String,
    capacity: Option<usize>,
    entries: VecDeque<QueuedTask>,
}

impl TaskQueue {
    /// Create an empty queue. `capacity = None` means unbounded.
    pub fn new(work_area: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            work_area: work_area.into(),
            capacity,
            entries: VecDeque::new(),
        }
    }

    /// Append to the tail, failing with [`Error::Full`] at capacity.
    pub fn add(&mut self, task: BackgroundTask) -> Result<()> {
        if let Some(capacity) = self.capacity
            && self.entries.len() >= capacity
        {
            return Err(Error::Full {
                work_area: self.work_area.clone(),
                capacity,
            });
        }
        self.entries.push_back(QueuedTask {
            task,
            privileged: false,
        });
        Ok(())
    }

    /// Append to the tail regardless of capacity.
    pub fn add_privileged(&mut self, task: BackgroundTask) {
        self.entries.push_back(QueuedTask {
            task,
            privileged: true,
        });
    }

    /// Remove and return the head.
    pub fn take(&mut self) -> Option<QueuedTask> {
        self.entries.pop_front()
    }

    /// Remove every ordinary task, keeping privileged ones in order.
    pub fn drain_ordinary(&mut self) -> Vec<BackgroundTask> {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.privileged {
                kept.push_back(entry);
            } else {
                drained.push(entry.task);
            }
        }
        self.entries = kept;
        drained
    }

    /// Number of queued tasks.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Inspect the `i`-th task without removing it (0 is the head).
    pub fn peek(&self, i: usize) -> Option<TaskSummary> {
        self.entries.get(i).map(|e| e.task.summary())
    }

    /// Summaries of every queued task, head first.
    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.entries.iter().map(|e| e.task.summary()).collect()
    }
}
