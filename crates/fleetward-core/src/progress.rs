// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress containers: pollable completion handles for background work.
//!
//! A [`ProgressContainer`] is created together with every background task
//! and handed back to the caller. The scheduler moves it through
//!
//! ```text
//!  PENDING ──start──▶ IN_PROGRESS ──complete──▶ COMPLETE
//!                          │
//!                          └───────fail──────▶ ERROR
//! ```
//!
//! Terminal states are sticky: once a container is COMPLETE or ERROR, later
//! transitions are ignored. Callers either poll (`status`, `has_error`,
//! `current_step`, ...) or await [`ProgressContainer::wait`].
//!
//! A [`MacroProgressContainer`] groups several containers raised together.
//! It is completed explicitly by its creator; its error state aggregates over
//! its children.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle state of a progress container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    /// Created, not yet picked up.
    Pending,
    /// Being executed.
    InProgress,
    /// Finished successfully.
    Complete,
    /// Finished with a captured error.
    Error,
}

impl ProgressStatus {
    /// COMPLETE or ERROR.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Complete | ProgressStatus::Error)
    }

    /// Status string as shown to operators.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "PENDING",
            ProgressStatus::InProgress => "IN_PROGRESS",
            ProgressStatus::Complete => "COMPLETE",
            ProgressStatus::Error => "ERROR",
        }
    }
}

#[derive(Debug)]
struct ProgressState {
    status: ProgressStatus,
    current_step: u32,
    total_steps: u32,
    step_label: Option<String>,
    error: Option<Arc<Error>>,
    result: Option<Value>,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

/// Serializable point-in-time view of a container.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    /// Container ID.
    pub id: Uuid,
    /// What the tracked work does.
    pub description: String,
    /// Resource the work concerns.
    pub correlator: Option<String>,
    /// Current status.
    pub status: ProgressStatus,
    /// Steps done so far.
    pub current_step: u32,
    /// Steps expected in total (0 if unknown).
    pub total_steps: u32,
    /// Label of the most recent step.
    pub step_label: Option<String>,
    /// Captured error message.
    pub error: Option<String>,
    /// Captured error code.
    pub error_code: Option<String>,
    /// Result value of a successful run.
    pub result: Option<Value>,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Completion handle for one unit of background work.
#[derive(Debug)]
pub struct ProgressContainer {
    id: Uuid,
    description: String,
    correlator: Option<String>,
    created_at: DateTime<Utc>,
    state: watch::Sender<ProgressState>,
}

impl ProgressContainer {
    /// Create a PENDING container.
    pub fn new(description: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(description.into(), None))
    }

    /// Create a PENDING container that names the resource it concerns.
    pub fn with_correlator(
        description: impl Into<String>,
        correlator: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self::build(description.into(), Some(correlator.into())))
    }

    fn build(description: String, correlator: Option<String>) -> Self {
        let now = Utc::now();
        let (state, _) = watch::channel(ProgressState {
            status: ProgressStatus::Pending,
            current_step: 0,
            total_steps: 0,
            step_label: None,
            error: None,
            result: None,
            started_at: None,
            updated_at: now,
        });
        Self {
            id: Uuid::new_v4(),
            description,
            correlator,
            created_at: now,
            state,
        }
    }

    /// Container ID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// What the tracked work does.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Resource the work concerns, if any.
    pub fn correlator(&self) -> Option<&str> {
        self.correlator.as_deref()
    }

    /// Current status.
    pub fn status(&self) -> ProgressStatus {
        self.state.borrow().status
    }

    /// True once the work has finished, successfully or not. Use
    /// [`has_error`](Self::has_error) to tell the two apart.
    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    /// True if the work finished with an error.
    pub fn has_error(&self) -> bool {
        self.state.borrow().error.is_some()
    }

    /// The captured error, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.state.borrow().error.clone()
    }

    /// The result of a successful run, if the work produced one.
    pub fn result(&self) -> Option<Value> {
        self.state.borrow().result.clone()
    }

    /// Steps done so far.
    pub fn current_step(&self) -> u32 {
        self.state.borrow().current_step
    }

    /// Steps expected in total (0 if unknown).
    pub fn total_steps(&self) -> u32 {
        self.state.borrow().total_steps
    }

    /// Label of the most recent step.
    pub fn step_label(&self) -> Option<String> {
        self.state.borrow().step_label.clone()
    }

    /// Set the expected number of steps.
    pub fn set_total_steps(&self, total: u32) {
        self.state.send_modify(|s| {
            s.total_steps = total;
            s.updated_at = Utc::now();
        });
    }

    /// Advance the step counter by `n` and record what the step was.
    pub fn increment_current_step(&self, n: u32, label: impl Into<String>) {
        let label = label.into();
        self.state.send_modify(|s| {
            s.current_step = s.current_step.saturating_add(n);
            if s.total_steps > 0 && s.current_step > s.total_steps {
                s.total_steps = s.current_step;
            }
            s.step_label = Some(label);
            s.updated_at = Utc::now();
        });
    }

    /// PENDING → IN_PROGRESS. Returns false if the container was not pending.
    pub fn start(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.status != ProgressStatus::Pending {
                return false;
            }
            let now = Utc::now();
            s.status = ProgressStatus::InProgress;
            s.started_at = Some(now);
            s.updated_at = now;
            true
        })
    }

    /// Mark COMPLETE with an optional result. Returns false if the container
    /// had already finished.
    pub fn complete(&self, result: Option<Value>) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.status = ProgressStatus::Complete;
            if s.total_steps > 0 {
                s.current_step = s.total_steps;
            }
            s.result = result;
            s.updated_at = Utc::now();
            true
        });
        if !changed {
            debug!(progress_id = %self.id, "Ignoring completion of finished container");
        }
        changed
    }

    /// Mark ERROR with the captured error. Returns false if the container had
    /// already finished.
    pub fn fail(&self, error: Error) -> bool {
        let error = Arc::new(error);
        let changed = self.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.status = ProgressStatus::Error;
            s.error = Some(error.clone());
            s.updated_at = Utc::now();
            true
        });
        if !changed {
            debug!(
                progress_id = %self.id,
                error = %error,
                "Ignoring failure of finished container"
            );
        }
        changed
    }

    /// Wait until the container reaches COMPLETE or ERROR.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|s| s.status.is_terminal()).await;
    }

    /// Wait with a deadline.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<ProgressStatus> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(()) => Ok(self.status()),
            Err(_) => Err(Error::Timeout {
                what: format!("progress '{}'", self.description),
                seconds: timeout.as_secs(),
            }),
        }
    }

    /// Wait until the container leaves PENDING.
    pub async fn wait_started(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.status != ProgressStatus::Pending).await;
    }

    /// Point-in-time view for status reporting.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let s = self.state.borrow();
        ProgressSnapshot {
            id: self.id,
            description: self.description.clone(),
            correlator: self.correlator.clone(),
            status: s.status,
            current_step: s.current_step,
            total_steps: s.total_steps,
            step_label: s.step_label.clone(),
            error: s.error.as_ref().map(|e| e.to_string()),
            error_code: s.error.as_ref().map(|e| e.error_code().to_string()),
            result: s.result.clone(),
            created_at: self.created_at,
            started_at: s.started_at,
            updated_at: s.updated_at,
        }
    }
}

/// Groups several progress containers raised together so a caller can watch
/// one handle.
///
/// The macro container's own status is driven only by its creator
/// ([`mark_complete`](Self::mark_complete) / [`fail`](Self::fail)); children
/// may still be running when it completes. [`has_error`](Self::has_error)
/// reports an error if the macro container or any child has one.
#[derive(Debug)]
pub struct MacroProgressContainer {
    container: Arc<ProgressContainer>,
    children: watch::Sender<Vec<Arc<ProgressContainer>>>,
}

impl MacroProgressContainer {
    /// Create an empty PENDING macro container.
    pub fn new(description: impl Into<String>) -> Arc<Self> {
        let (children, _) = watch::channel(Vec::new());
        Arc::new(Self {
            container: ProgressContainer::new(description),
            children,
        })
    }

    /// The macro container's own progress.
    pub fn container(&self) -> &Arc<ProgressContainer> {
        &self.container
    }

    /// Append a child. Also moves the macro container to IN_PROGRESS.
    pub fn add_child(&self, child: Arc<ProgressContainer>) {
        self.container.start();
        self.children.send_modify(|c| c.push(child));
        self.container
            .increment_current_step(0, format!("{} children", self.child_count()));
    }

    /// Children in insertion order.
    pub fn children(&self) -> Vec<Arc<ProgressContainer>> {
        self.children.borrow().clone()
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.borrow().len()
    }

    /// Mark the group complete. Independent of child completion.
    pub fn mark_complete(&self) -> bool {
        self.container.start();
        let finished = self.finished_children();
        self.container.complete(Some(serde_json::json!({
            "children": self.child_count(),
            "finished": finished,
            "failed": self.failed_children().len(),
        })))
    }

    /// Mark the group failed.
    pub fn fail(&self, error: Error) -> bool {
        self.container.fail(error)
    }

    /// Own status.
    pub fn status(&self) -> ProgressStatus {
        self.container.status()
    }

    /// True once the creator has marked the group complete (or failed).
    pub fn is_complete(&self) -> bool {
        self.container.is_complete()
    }

    /// True if the group or any child captured an error.
    pub fn has_error(&self) -> bool {
        self.container.has_error() || self.children.borrow().iter().any(|c| c.has_error())
    }

    /// Children that finished with an error.
    pub fn failed_children(&self) -> Vec<Arc<ProgressContainer>> {
        self.children
            .borrow()
            .iter()
            .filter(|c| c.has_error())
            .cloned()
            .collect()
    }

    /// Number of children that have finished.
    pub fn finished_children(&self) -> usize {
        self.children
            .borrow()
            .iter()
            .filter(|c| c.is_complete())
            .count()
    }

    /// Wait until every child added so far has finished.
    pub async fn wait_children(&self) {
        for child in self.children() {
            child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_container_is_pending() {
        let p = ProgressContainer::with_correlator("push firmware", "device:a");
        assert_eq!(p.status(), ProgressStatus::Pending);
        assert!(!p.is_complete());
        assert!(!p.has_error());
        assert_eq!(p.correlator(), Some("device:a"));
        assert_eq!(p.current_step(), 0);
    }

    #[test]
    fn test_step_counters() {
        let p = ProgressContainer::new("deploy");
        p.set_total_steps(3);
        p.increment_current_step(1, "uploading");
        p.increment_current_step(1, "applying");
        assert_eq!(p.current_step(), 2);
        assert_eq!(p.total_steps(), 3);
        assert_eq!(p.step_label().as_deref(), Some("applying"));
    }

    #[test]
    fn test_complete_with_result() {
        let p = ProgressContainer::new("backup");
        assert!(p.start());
        assert_eq!(p.status(), ProgressStatus::InProgress);
        assert!(p.complete(Some(serde_json::json!({"bytes": 42}))));
        assert!(p.is_complete());
        assert!(!p.has_error());
        assert_eq!(p.result().unwrap()["bytes"], 42);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let p = ProgressContainer::new("quiesce");
        p.start();
        assert!(p.fail(Error::Other("boom".to_string())));
        assert!(!p.complete(None));
        assert_eq!(p.status(), ProgressStatus::Error);
        assert_eq!(p.error().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_snapshot_carries_error_code() {
        let p = ProgressContainer::new("restore");
        p.fail(Error::Deleted {
            handle: "h".to_string(),
        });
        let snap = p.snapshot();
        assert_eq!(snap.status, ProgressStatus::Error);
        assert_eq!(snap.error_code.as_deref(), Some("DELETED"));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "ERROR");
    }

    #[tokio::test]
    async fn test_wait_returns_after_completion() {
        let p = ProgressContainer::new("wait");
        let p2 = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            p2.start();
            p2.complete(None);
        });
        let status = p.wait_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(status, ProgressStatus::Complete);
    }

    #[tokio::test]
    async fn test_wait_timeout_elapses() {
        let p = ProgressContainer::new("never");
        let err = p
            .wait_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_macro_requires_explicit_completion() {
        let group = MacroProgressContainer::new("load fleet");
        let a = ProgressContainer::new("a");
        let b = ProgressContainer::new("b");
        group.add_child(a.clone());
        group.add_child(b.clone());

        a.complete(None);
        b.complete(None);
        assert!(!group.is_complete(), "children finishing must not complete the group");

        assert!(group.mark_complete());
        assert!(group.is_complete());
        assert_eq!(group.child_count(), 2);
    }

    #[test]
    fn test_macro_error_aggregates_from_children() {
        let group = MacroProgressContainer::new("load fleet");
        let ok = ProgressContainer::new("ok");
        let bad = ProgressContainer::new("bad");
        group.add_child(ok.clone());
        group.add_child(bad.clone());

        ok.complete(None);
        assert!(!group.has_error());
        bad.fail(Error::protocol("device:x", "unreachable"));
        assert!(group.has_error());
        assert_eq!(group.failed_children().len(), 1);

        group.mark_complete();
        assert_eq!(group.status(), ProgressStatus::Complete);
        assert!(group.has_error());
    }
}
