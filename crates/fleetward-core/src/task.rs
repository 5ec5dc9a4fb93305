// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background tasks: deferred units of work bound to a target resource.
//!
//! A task is built either from a [`TaskOperation`] implementation or from an
//! async closure, and always carries a fresh PENDING [`ProgressContainer`].
//! The queue processor consumes each task exactly once.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::progress::ProgressContainer;

/// Work performed by a background task.
#[async_trait]
pub trait TaskOperation: Send + Sync {
    /// Execute the operation, reporting steps through `progress`.
    ///
    /// The returned value becomes the container's result. Errors are captured
    /// into the container by the processor.
    async fn execute(&self, progress: &ProgressContainer) -> Result<Option<Value>>;
}

/// Who raised a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// An operator or API caller.
    User,
    /// A reconciliation daemon.
    Reconciliation,
    /// The engine itself (startup, shutdown).
    System,
}

type TaskAction =
    Box<dyn FnOnce(Arc<ProgressContainer>) -> BoxFuture<'static, Result<Option<Value>>> + Send>;

/// A unit of deferred work.
pub struct BackgroundTask {
    id: Uuid,
    kind: String,
    targets: Vec<String>,
    origin: TaskOrigin,
    attempt: u32,
    created_at: DateTime<Utc>,
    progress: Arc<ProgressContainer>,
    action: TaskAction,
}

impl fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("targets", &self.targets)
            .field("origin", &self.origin)
            .field("attempt", &self.attempt)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl BackgroundTask {
    /// Build a task from an operation object.
    pub fn new(
        kind: impl Into<String>,
        target: impl Into<String>,
        operation: Arc<dyn TaskOperation>,
    ) -> Self {
        Self::from_fn(kind, target, move |progress| async move {
            operation.execute(&progress).await
        })
    }

    /// Build a task from an async closure.
    pub fn from_fn<F, Fut>(kind: impl Into<String>, target: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(Arc<ProgressContainer>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let kind = kind.into();
        let target = target.into();
        let progress = ProgressContainer::with_correlator(kind.clone(), target.clone());
        Self {
            id: Uuid::new_v4(),
            kind,
            targets: vec![target],
            origin: TaskOrigin::User,
            attempt: 0,
            created_at: Utc::now(),
            progress,
            action: Box::new(move |p| -> BoxFuture<'static, Result<Option<Value>>> {
                Box::pin(f(p))
            }),
        }
    }

    /// Add a further resource the task touches.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Set who raised the task.
    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Mark the task as raised by reconciliation, with its attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.origin = TaskOrigin::Reconciliation;
        self.attempt = attempt;
        self
    }

    /// Task ID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Operation kind, e.g. `firmware_push`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Resources the task targets; the first is the primary target.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Who raised the task.
    pub fn origin(&self) -> TaskOrigin {
        self.origin
    }

    /// Attempt counter for reconciliation-raised tasks (0 otherwise).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the task was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The task's progress container.
    pub fn progress(&self) -> Arc<ProgressContainer> {
        self.progress.clone()
    }

    /// Lightweight description for status reporting.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            kind: self.kind.clone(),
            targets: self.targets.clone(),
            origin: self.origin,
            attempt: self.attempt,
            created_at: self.created_at,
            progress_id: self.progress.id(),
        }
    }

    /// Split into the runnable action and its container. Consumes the task.
    pub(crate) fn into_action(
        self,
    ) -> (
        BoxFuture<'static, Result<Option<Value>>>,
        Arc<ProgressContainer>,
    ) {
        let progress = self.progress;
        let fut = (self.action)(progress.clone());
        (fut, progress)
    }
}

/// Serializable description of a queued task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    /// Task ID.
    pub id: Uuid,
    /// Operation kind.
    pub kind: String,
    /// Target resources.
    pub targets: Vec<String>,
    /// Who raised the task.
    pub origin: TaskOrigin,
    /// Reconciliation attempt.
    pub attempt: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// ID of the task's progress container.
    pub progress_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStatus;

    struct Echo;

    #[async_trait]
    impl TaskOperation for Echo {
        async fn execute(&self, progress: &ProgressContainer) -> Result<Option<Value>> {
            progress.increment_current_step(1, "echo");
            Ok(Some(serde_json::json!("echo")))
        }
    }

    #[tokio::test]
    async fn test_task_from_operation() {
        let task = BackgroundTask::new("echo", "device:a", Arc::new(Echo));
        assert_eq!(task.kind(), "echo");
        assert_eq!(task.targets().to_vec(), vec!["device:a".to_string()]);
        assert_eq!(task.origin(), TaskOrigin::User);

        let progress = task.progress();
        assert_eq!(progress.status(), ProgressStatus::Pending);
        assert_eq!(progress.correlator(), Some("device:a"));

        let (fut, p) = task.into_action();
        let value = fut.await.unwrap();
        assert_eq!(value, Some(serde_json::json!("echo")));
        assert_eq!(p.current_step(), 1);
    }

    #[test]
    fn test_reconciliation_attempt() {
        let task = BackgroundTask::from_fn("resubscribe", "device:b", |_| async { Ok(None) })
            .with_attempt(2)
            .with_target("manager");
        assert_eq!(task.origin(), TaskOrigin::Reconciliation);
        assert_eq!(task.attempt(), 2);
        assert_eq!(task.targets().len(), 2);
        let summary = task.summary();
        assert_eq!(summary.kind, "resubscribe");
        assert_eq!(summary.progress_id, task.progress().id());
    }
}
