// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation daemons.
//!
//! A daemon wakes up on an interval, lists its targets and probes each one on
//! a bounded pool. A probe compares observed and desired state and, on
//! divergence, queues a corrective task through the regular enqueue path.
//!
//! Consecutive probe failures are counted per target. When the count reaches
//! `retry_max` the target is suspended and skipped until [`reset`] or
//! [`reset_all`] is called.
//!
//! [`reset`]: ReconciliationDaemon::reset
//! [`reset_all`]: ReconciliationDaemon::reset_all

pub mod domain_sync;
pub mod heartbeat;

pub use self::domain_sync::DomainSyncReconciler;
pub use self::heartbeat::HeartbeatReconciler;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetward_core::{EntityHandle, Error, ProgressContainer, Result};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Configuration for a reconciliation daemon.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Whether the daemon runs at all.
    pub enabled: bool,
    /// Time between ticks.
    pub interval: Duration,
    /// Maximum probes in flight.
    pub pool_size: usize,
    /// Consecutive failures before a target is suspended.
    pub retry_max: u32,
    /// Whether probe outcomes are kept for inspection.
    pub record_outcomes: bool,
    /// Outcomes kept when recording (oldest evicted first).
    pub outcome_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self::heartbeat()
    }
}

impl ReconcileConfig {
    /// Defaults for the heartbeat daemon.
    pub fn heartbeat() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            pool_size: 8,
            retry_max: 3,
            record_outcomes: false,
            outcome_capacity: 256,
        }
    }

    /// Defaults for the domain-synchronization daemon.
    pub fn domain_sync() -> Self {
        Self {
            interval: Duration::from_secs(300),
            ..Self::heartbeat()
        }
    }

    /// Overlay `{prefix}_*` environment variables on `defaults`.
    ///
    /// Environment variables:
    /// - `{prefix}_ENABLED`: Enable the daemon (default: true)
    /// - `{prefix}_INTERVAL_SECS`: Seconds between ticks
    /// - `{prefix}_POOL_SIZE`: Probes in flight (default: 8)
    /// - `{prefix}_RETRY_MAX`: Failures before suspension (default: 3)
    /// - `{prefix}_RECORD_OUTCOMES`: Keep probe outcomes (default: false)
    pub fn from_env(prefix: &str, defaults: Self) -> Self {
        let var = |name: &str| std::env::var(format!("{}_{}", prefix, name)).ok();
        let flag = |name: &str| var(name).map(|v| v == "true" || v == "1");

        Self {
            enabled: flag("ENABLED").unwrap_or(defaults.enabled),
            interval: var("INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            pool_size: var("POOL_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.pool_size),
            retry_max: var("RETRY_MAX")
                .and_then(|v| v.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.retry_max),
            record_outcomes: flag("RECORD_OUTCOMES").unwrap_or(defaults.record_outcomes),
            outcome_capacity: defaults.outcome_capacity,
        }
    }
}

/// What a probe found.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// Observed state matches desired state.
    InSync,
    /// A corrective task was queued.
    Corrected {
        /// Kind of the corrective task.
        action: &'static str,
        /// The corrective task's progress.
        progress: Arc<ProgressContainer>,
    },
    /// The target could not be examined right now (busy, not applicable).
    Skipped {
        /// Why.
        reason: String,
    },
}

impl ProbeOutcome {
    fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::InSync => "in_sync",
            ProbeOutcome::Corrected { .. } => "corrected",
            ProbeOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Per-daemon probe logic.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs and progress descriptions.
    fn name(&self) -> &'static str;

    /// Resources to probe this tick.
    async fn targets(&self) -> Result<Vec<EntityHandle>>;

    /// Probe one target and queue a correction if needed. `attempt` counts
    /// consecutive corrections for the target, starting at 1.
    async fn reconcile(&self, target: &EntityHandle, attempt: u32) -> Result<ProbeOutcome>;
}

/// Consecutive-failure bookkeeping.
#[derive(Debug)]
pub struct FailureTracker {
    retry_max: u32,
    failures: HashMap<EntityHandle, u32>,
    corrections: HashMap<EntityHandle, u32>,
}

impl FailureTracker {
    /// Tracker suspending targets after `retry_max` failures.
    pub fn new(retry_max: u32) -> Self {
        Self {
            retry_max,
            failures: HashMap::new(),
            corrections: HashMap::new(),
        }
    }

    /// Whether `target` is skipped.
    pub fn is_suspended(&self, target: &EntityHandle) -> bool {
        self.failure_count(target) >= self.retry_max
    }

    /// Consecutive failures of `target`.
    pub fn failure_count(&self, target: &EntityHandle) -> u32 {
        self.failures.get(target).copied().unwrap_or(0)
    }

    /// Count a failure. Returns true if the target just got suspended.
    pub fn record_failure(&mut self, target: &EntityHandle) -> bool {
        let count = self.failures.entry(target.clone()).or_insert(0);
        *count += 1;
        *count == self.retry_max
    }

    /// Clear the failure count.
    pub fn record_success(&mut self, target: &EntityHandle) {
        self.failures.remove(target);
    }

    /// Count a queued correction.
    pub fn record_correction(&mut self, target: &EntityHandle) {
        *self.corrections.entry(target.clone()).or_insert(0) += 1;
    }

    /// Forget corrections once the target is back in sync.
    pub fn clear_corrections(&mut self, target: &EntityHandle) {
        self.corrections.remove(target);
    }

    /// Attempt number of the next correction for `target`.
    pub fn next_attempt(&self, target: &EntityHandle) -> u32 {
        self.corrections.get(target).copied().unwrap_or(0) + 1
    }

    /// Re-enable one target. Returns true if it was suspended.
    pub fn reset(&mut self, target: &EntityHandle) -> bool {
        let was = self.is_suspended(target);
        self.failures.remove(target);
        was
    }

    /// Re-enable every target.
    pub fn reset_all(&mut self) {
        self.failures.clear();
    }

    /// Suspended targets, sorted.
    pub fn suspended(&self) -> Vec<EntityHandle> {
        let mut out: Vec<EntityHandle> = self
            .failures
            .iter()
            .filter(|(_, n)| **n >= self.retry_max)
            .map(|(h, _)| h.clone())
            .collect();
        out.sort();
        out
    }
}

/// Bounded log of probe outcomes, oldest evicted first.
#[derive(Debug)]
pub struct OutcomeLog {
    capacity: usize,
    entries: VecDeque<Arc<ProgressContainer>>,
}

impl OutcomeLog {
    /// Empty log holding at most `capacity` outcomes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append an outcome, evicting the oldest when full.
    pub fn push(&mut self, outcome: Arc<ProgressContainer>) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(outcome);
    }

    /// Recorded outcomes, oldest first.
    pub fn entries(&self) -> Vec<Arc<ProgressContainer>> {
        self.entries.iter().cloned().collect()
    }

    /// Number of recorded outcomes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-tick counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Targets probed.
    pub probed: usize,
    /// Probes that found the target in sync.
    pub in_sync: usize,
    /// Corrective tasks queued.
    pub corrected: usize,
    /// Probes that failed.
    pub failed: usize,
    /// Targets skipped: suspended, busy, or with a correction still pending.
    pub skipped: usize,
}

/// Periodic driver for a [`Reconciler`].
pub struct ReconciliationDaemon<R: Reconciler> {
    reconciler: Arc<R>,
    config: ReconcileConfig,
    pool: Arc<Semaphore>,
    tracker: Mutex<FailureTracker>,
    pending: Mutex<HashMap<EntityHandle, Arc<ProgressContainer>>>,
    outcomes: Mutex<OutcomeLog>,
    shutdown: Arc<Notify>,
}

impl<R: Reconciler> ReconciliationDaemon<R> {
    /// Create a daemon driving `reconciler`.
    pub fn new(reconciler: R, config: ReconcileConfig) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            pool: Arc::new(Semaphore::new(config.pool_size.max(1))),
            tracker: Mutex::new(FailureTracker::new(config.retry_max)),
            pending: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(OutcomeLog::new(config.outcome_capacity)),
            shutdown: Arc::new(Notify::new()),
            config,
        }
    }

    /// Daemon name.
    pub fn name(&self) -> &'static str {
        self.reconciler.name()
    }

    /// Whether [`run`](Self::run) will loop.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the daemon loop until shutdown is signalled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!(daemon = self.name(), "Reconciliation daemon disabled");
            return;
        }

        info!(
            daemon = self.name(),
            interval_secs = self.config.interval.as_secs(),
            pool_size = self.config.pool_size,
            retry_max = self.config.retry_max,
            "Reconciliation daemon started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(daemon = self.name(), "Reconciliation daemon received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(daemon = self.name(), error = %e, "Reconciliation tick failed");
                    }
                }
            }
        }

        info!(daemon = self.name(), "Reconciliation daemon stopped");
    }

    /// Probe every eligible target once and wait for all probes.
    pub async fn tick(&self) -> Result<TickSummary> {
        let targets = self.reconciler.targets().await?;
        let mut summary = TickSummary::default();
        let mut probes = JoinSet::new();

        for target in targets {
            let attempt = {
                let tracker = self.tracker.lock().await;
                if tracker.is_suspended(&target) {
                    summary.skipped += 1;
                    continue;
                }
                tracker.next_attempt(&target)
            };
            if self.correction_pending(&target).await {
                debug!(daemon = self.name(), target = %target, "Correction still pending");
                summary.skipped += 1;
                continue;
            }

            let permit = self
                .pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Other(format!("probe pool closed: {}", e)))?;
            let reconciler = self.reconciler.clone();
            probes.spawn(async move {
                let _permit = permit;
                let outcome = reconciler.reconcile(&target, attempt).await;
                (target, outcome)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((target, outcome)) => self.record(&target, outcome, &mut summary).await,
                Err(e) => {
                    error!(daemon = self.name(), error = %e, "Probe task panicked");
                    summary.failed += 1;
                }
            }
        }

        if summary.corrected > 0 || summary.failed > 0 {
            info!(
                daemon = self.name(),
                probed = summary.probed,
                corrected = summary.corrected,
                failed = summary.failed,
                skipped = summary.skipped,
                "Reconciliation tick finished"
            );
        } else {
            debug!(daemon = self.name(), probed = summary.probed, "Reconciliation tick finished");
        }
        Ok(summary)
    }

    async fn correction_pending(&self, target: &EntityHandle) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.get(target) {
            Some(progress) if !progress.is_complete() => true,
            Some(_) => {
                pending.remove(target);
                false
            }
            None => false,
        }
    }

    async fn record(
        &self,
        target: &EntityHandle,
        outcome: Result<ProbeOutcome>,
        summary: &mut TickSummary,
    ) {
        let observed = self.config.record_outcomes.then(|| {
            let progress = ProgressContainer::with_correlator(
                format!("{} probe", self.name()),
                target.to_string(),
            );
            progress.start();
            progress
        });

        match outcome {
            Ok(outcome) => {
                let mut tracker = self.tracker.lock().await;
                match &outcome {
                    ProbeOutcome::InSync => {
                        summary.probed += 1;
                        summary.in_sync += 1;
                        tracker.record_success(target);
                        tracker.clear_corrections(target);
                    }
                    ProbeOutcome::Corrected { action, progress } => {
                        summary.probed += 1;
                        summary.corrected += 1;
                        tracker.record_success(target);
                        tracker.record_correction(target);
                        self.pending
                            .lock()
                            .await
                            .insert(target.clone(), progress.clone());
                        info!(
                            daemon = self.name(),
                            target = %target,
                            action = *action,
                            "Correction queued"
                        );
                    }
                    ProbeOutcome::Skipped { reason } => {
                        summary.skipped += 1;
                        debug!(
                            daemon = self.name(),
                            target = %target,
                            reason = %reason,
                            "Probe skipped"
                        );
                    }
                }
                if let Some(observed) = &observed {
                    observed.complete(Some(serde_json::json!({ "outcome": outcome.label() })));
                }
            }
            Err(e) => {
                summary.probed += 1;
                summary.failed += 1;
                let suspended = self.tracker.lock().await.record_failure(target);
                if suspended {
                    warn!(
                        daemon = self.name(),
                        target = %target,
                        retry_max = self.config.retry_max,
                        error = %e,
                        "Target suspended after repeated probe failures"
                    );
                } else {
                    debug!(daemon = self.name(), target = %target, error = %e, "Probe failed");
                }
                if let Some(observed) = &observed {
                    observed.fail(e);
                }
            }
        }

        if let Some(observed) = observed {
            self.outcomes.lock().await.push(observed);
        }
    }

    /// Re-enable a suspended target. Returns true if it was suspended.
    pub async fn reset(&self, target: &EntityHandle) -> bool {
        let was = self.tracker.lock().await.reset(target);
        if was {
            info!(daemon = self.name(), target = %target, "Target re-enabled");
        }
        was
    }

    /// Re-enable every suspended target.
    pub async fn reset_all(&self) {
        self.tracker.lock().await.reset_all();
        info!(daemon = self.name(), "All targets re-enabled");
    }

    /// Suspended targets.
    pub async fn suspended(&self) -> Vec<EntityHandle> {
        self.tracker.lock().await.suspended()
    }

    /// Consecutive probe failures of `target`.
    pub async fn failure_count(&self, target: &EntityHandle) -> u32 {
        self.tracker.lock().await.failure_count(target)
    }

    /// Recorded probe outcomes, oldest first. Empty unless
    /// `record_outcomes` is set.
    pub async fn outcomes(&self) -> Vec<Arc<ProgressContainer>> {
        self.outcomes.lock().await.entries()
    }
}
