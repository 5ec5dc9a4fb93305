// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue processor: routes tasks to work areas and runs one worker per area.
//!
//! Each registered work area gets a worker loop the first time a task is
//! enqueued for it. The worker takes tasks from the head of the area's queue
//! and runs them one at a time, so tasks in the same area never overlap while
//! tasks in different areas run concurrently.
//!
//! Failures (returned errors and panics alike) are captured into the task's
//! progress container; the worker keeps going.
//!
//! Shutdown stops ordinary enqueues, lets the running task finish, discards
//! the remaining ordinary tasks (their containers end in ERROR with
//! `ShuttingDown`), runs any privileged tasks, and joins every worker.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::progress::ProgressContainer;
use crate::task::BackgroundTask;
use crate::work_area::{WorkArea, WorkAreaId, WorkAreaStats};

/// Configuration for the queue processor.
#[derive(Debug, Clone, Default)]
pub struct QueueProcessorConfig {
    /// Capacity applied to work areas created without an explicit one.
    /// `None` means unbounded.
    pub default_capacity: Option<usize>,
}

/// Scheduler owning every work area.
#[derive(Debug)]
pub struct QueueProcessor {
    config: QueueProcessorConfig,
    areas: RwLock<HashMap<WorkAreaId, Arc<WorkArea>>>,
    accepting: AtomicBool,
}

impl QueueProcessor {
    /// Create a processor with no work areas.
    pub fn new(config: QueueProcessorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            areas: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        })
    }

    /// Whether ordinary tasks are still accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Register a work area. `capacity = None` applies the default capacity.
    pub async fn register_work_area(
        &self,
        id: WorkAreaId,
        capacity: Option<usize>,
    ) -> Result<Arc<WorkArea>> {
        if !self.is_accepting() {
            return Err(Error::ShuttingDown(id.to_string()));
        }
        let mut areas = self.areas.write().await;
        if areas.contains_key(&id) {
            return Err(Error::AlreadyRegistered {
                handle: id.to_string(),
            });
        }
        let capacity = capacity.or(self.config.default_capacity);
        let area = Arc::new(WorkArea::new(id.clone(), capacity));
        areas.insert(id.clone(), area.clone());
        debug!(work_area = %id, capacity = ?capacity, "Work area registered");
        Ok(area)
    }

    /// Look up a registered work area.
    pub async fn work_area(&self, id: &WorkAreaId) -> Option<Arc<WorkArea>> {
        self.areas.read().await.get(id).cloned()
    }

    /// IDs of all registered work areas, sorted.
    pub async fn work_area_ids(&self) -> Vec<WorkAreaId> {
        let mut ids: Vec<WorkAreaId> = self.areas.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Append a task to the tail of a work area's queue.
    ///
    /// Returns the task's progress container. Fails with
    /// [`Error::UnknownWorkArea`], [`Error::ShuttingDown`] or [`Error::Full`];
    /// on failure the task is dropped and its container stays PENDING.
    pub async fn enqueue(
        &self,
        task: BackgroundTask,
        id: &WorkAreaId,
    ) -> Result<Arc<ProgressContainer>> {
        if !self.is_accepting() {
            return Err(Error::ShuttingDown(id.to_string()));
        }
        let area = self
            .work_area(id)
            .await
            .ok_or_else(|| Error::UnknownWorkArea(id.to_string()))?;

        let progress = task.progress();
        let kind = task.kind().to_string();
        {
            let mut state = area.state.lock().await;
            if state.closing {
                return Err(Error::ShuttingDown(id.to_string()));
            }
            if let Err(e) = state.queue.add(task) {
                area.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(work_area = %id, task_kind = %kind, "Rejected task: queue full");
                return Err(e);
            }
            area.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            ensure_worker(&area, &mut state);
        }
        area.notify.notify_one();

        debug!(work_area = %id, task_kind = %kind, progress_id = %progress.id(), "Task enqueued");
        Ok(progress)
    }

    /// Enqueue bypassing capacity and shutdown checks. Always succeeds.
    ///
    /// An unknown work area is registered on the fly. Used for startup and
    /// shutdown work that must run even when the area is full or closing.
    /// After shutdown began the area is closed, so its worker exits once the
    /// queue is empty.
    pub async fn privileged_enqueue(
        &self,
        task: BackgroundTask,
        id: &WorkAreaId,
    ) -> Arc<ProgressContainer> {
        let area = {
            let mut areas = self.areas.write().await;
            areas
                .entry(id.clone())
                .or_insert_with(|| {
                    Arc::new(WorkArea::new(id.clone(), self.config.default_capacity))
                })
                .clone()
        };

        let progress = task.progress();
        let kind = task.kind().to_string();
        {
            let mut state = area.state.lock().await;
            if !self.is_accepting() {
                state.closing = true;
            }
            state.queue.add_privileged(task);
            area.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            ensure_worker(&area, &mut state);
        }
        area.notify.notify_one();

        debug!(work_area = %id, task_kind = %kind, "Privileged task enqueued");
        progress
    }

    /// Close a work area, drain it and remove it from the processor.
    ///
    /// Waits for the running task to finish and for privileged tasks to run.
    pub async fn unregister_work_area(&self, id: &WorkAreaId) -> Result<()> {
        let area = self
            .areas
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::UnknownWorkArea(id.to_string()))?;
        close_area(&area).await;
        join_area(&area).await;
        debug!(work_area = %id, "Work area unregistered");
        Ok(())
    }

    /// Stop accepting ordinary tasks and close every work area without
    /// waiting.
    ///
    /// Privileged tasks enqueued after this call still run before the workers
    /// exit. Follow with [`shutdown`](Self::shutdown) to join.
    pub async fn begin_shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Queue processor shutting down");
        }
        let areas: Vec<Arc<WorkArea>> = self.areas.read().await.values().cloned().collect();
        for area in &areas {
            close_area(area).await;
        }
    }

    /// Shut down: close every area, then join every worker.
    pub async fn shutdown(&self) {
        self.begin_shutdown().await;
        let areas: Vec<Arc<WorkArea>> = self.areas.read().await.values().cloned().collect();
        for area in &areas {
            join_area(area).await;
        }
        info!(work_areas = areas.len(), "Queue processor stopped");
    }

    /// Statistics for every work area, sorted by ID.
    pub async fn stats(&self) -> Vec<WorkAreaStats> {
        let areas: Vec<Arc<WorkArea>> = self.areas.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(areas.len());
        for area in areas {
            stats.push(area.stats().await);
        }
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }
}

/// Spawn the worker loop if none is alive. Caller holds the state lock.
fn ensure_worker(area: &Arc<WorkArea>, state: &mut crate::work_area::WorkAreaState) {
    if state.worker_running {
        return;
    }
    state.worker_running = true;
    let worker_area = area.clone();
    state
        .workers
        .push(tokio::spawn(async move { run_worker(worker_area).await }));
    debug!(work_area = %area.id(), "Work area worker started");
}

async fn close_area(area: &Arc<WorkArea>) {
    {
        let mut state = area.state.lock().await;
        state.closing = true;
        if !state.worker_running && !state.queue.is_empty() {
            ensure_worker(area, &mut state);
        }
    }
    area.notify.notify_one();
}

async fn join_area(area: &Arc<WorkArea>) {
    loop {
        let handles = std::mem::take(&mut area.state.lock().await.workers);
        if handles.is_empty() {
            break;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(work_area = %area.id(), error = %e, "Work area worker failed");
            }
        }
    }
}

async fn run_worker(area: Arc<WorkArea>) {
    loop {
        let next = {
            let mut state = area.state.lock().await;
            if state.closing {
                let discarded = state.queue.drain_ordinary();
                if !discarded.is_empty() {
                    info!(
                        work_area = %area.id(),
                        count = discarded.len(),
                        "Discarding queued tasks at shutdown"
                    );
                }
                for task in discarded {
                    task.progress()
                        .fail(Error::ShuttingDown(area.id().to_string()));
                    area.counters.discarded.fetch_add(1, Ordering::Relaxed);
                }
            }
            match state.queue.take() {
                Some(entry) => {
                    state.current = Some(entry.task.summary());
                    Some(entry.task)
                }
                None if state.closing => {
                    state.worker_running = false;
                    break;
                }
                None => None,
            }
        };

        match next {
            Some(task) => {
                execute(&area, task).await;
                area.state.lock().await.current = None;
            }
            None => area.notify.notified().await,
        }
    }
    debug!(work_area = %area.id(), "Work area worker stopped");
}

async fn execute(area: &WorkArea, task: BackgroundTask) {
    let task_id = task.id();
    let kind = task.kind().to_string();
    let (fut, progress) = task.into_action();

    progress.start();
    debug!(work_area = %area.id(), task_id = %task_id, task_kind = %kind, "Task started");

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(result)) => {
            area.counters.completed.fetch_add(1, Ordering::Relaxed);
            progress.complete(result);
            debug!(work_area = %area.id(), task_id = %task_id, task_kind = %kind, "Task completed");
        }
        Ok(Err(e)) => {
            warn!(
                work_area = %area.id(),
                task_id = %task_id,
                task_kind = %kind,
                error = %e,
                "Task failed"
            );
            area.counters.failed.fetch_add(1, Ordering::Relaxed);
            progress.fail(e);
        }
        Err(_) => {
            error!(work_area = %area.id(), task_id = %task_id, task_kind = %kind, "Task panicked");
            area.counters.failed.fetch_add(1, Ordering::Relaxed);
            progress.fail(Error::TaskPanicked(kind));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStatus;
    use std::time::Duration;

    fn noop(kind: &str) -> BackgroundTask {
        BackgroundTask::from_fn(kind.to_string(), "device:a", |_| async { Ok(None) })
    }

    #[tokio::test]
    async fn test_enqueue_unknown_work_area() {
        let processor = QueueProcessor::new(QueueProcessorConfig::default());
        let err = processor
            .enqueue(noop("x"), &WorkAreaId::managed_set("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownWorkArea(_)));
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let processor = QueueProcessor::new(QueueProcessorConfig::default());
        processor
            .register_work_area(WorkAreaId::Manager, None)
            .await
            .unwrap();
        let err = processor
            .register_work_area(WorkAreaId::Manager, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn test_task_runs_to_completion() {
        let processor = QueueProcessor::new(QueueProcessorConfig::default());
        processor
            .register_work_area(WorkAreaId::Manager, None)
            .await
            .unwrap();

        let task = BackgroundTask::from_fn("answer", "manager", |p| async move {
            p.increment_current_step(1, "thinking");
            Ok(Some(serde_json::json!(42)))
        });
        let progress = processor.enqueue(task, &WorkAreaId::Manager).await.unwrap();

        let status = progress
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(status, ProgressStatus::Complete);
        assert_eq!(progress.result(), Some(serde_json::json!(42)));

        processor.shutdown().await;
        let stats = processor.stats().await;
        assert_eq!(stats[0].completed, 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_rejected() {
        let processor = QueueProcessor::new(QueueProcessorConfig::default());
        processor
            .register_work_area(WorkAreaId::Manager, None)
            .await
            .unwrap();
        processor.shutdown().await;

        let err = processor
            .enqueue(noop("late"), &WorkAreaId::Manager)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown(_)));

        let progress = processor
            .privileged_enqueue(noop("unsubscribe_all"), &WorkAreaId::Manager)
            .await;
        progress.wait_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(progress.status(), ProgressStatus::Complete);
    }

    #[tokio::test]
    async fn test_privileged_enqueue_after_shutdown_new_area_stops() {
        let processor = QueueProcessor::new(QueueProcessorConfig::default());
        processor.shutdown().await;

        let id = WorkAreaId::managed_set("late");
        let progress = processor.privileged_enqueue(noop("cleanup"), &id).await;
        let status = progress
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(status, ProgressStatus::Complete);

        let area = processor.work_area(&id).await.unwrap();
        assert!(area.is_closing().await);
        tokio::time::timeout(Duration::from_secs(2), processor.shutdown())
            .await
            .expect("worker of the late area did not exit");
        let state = area.state.lock().await;
        assert!(!state.worker_running);
        assert!(state.workers.is_empty());
    }
}
