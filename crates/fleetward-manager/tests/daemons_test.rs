// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the heartbeat and domain-sync daemons against a simulated fleet.

mod common;

use std::future::Future;
use std::time::Duration;

use common::{TestFleet, finish};
use fleetward_core::{Lockable, ProgressStatus};
use fleetward_manager::{
    DomainSyncReconciler, HeartbeatReconciler, OperationalStatus, ReconcileConfig,
    ReconciliationDaemon,
};

fn daemon_config() -> ReconcileConfig {
    ReconcileConfig {
        interval: Duration::from_millis(50),
        pool_size: 4,
        retry_max: 3,
        ..ReconcileConfig::heartbeat()
    }
}

/// Poll `check` until it holds, failing after five seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test]
async fn test_heartbeat_in_sync() {
    let fleet = TestFleet::new().await;
    fleet.device("edge-1", "10.0.0.1").await;
    let daemon = ReconciliationDaemon::new(
        HeartbeatReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );

    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.probed, 1);
    assert_eq!(summary.in_sync, 1);
    assert_eq!(summary.corrected, 0);
}

#[tokio::test]
async fn test_heartbeat_resubscribes_lost_subscription() {
    let fleet = TestFleet::new().await;
    fleet.device("edge-1", "10.0.0.1").await;
    let daemon = ReconciliationDaemon::new(
        HeartbeatReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );

    fleet.sim.drop_subscription("10.0.0.1").await;
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.corrected, 1);

    eventually("resubscription", || fleet.sim.is_subscribed("10.0.0.1")).await;
}

#[tokio::test]
async fn test_heartbeat_refreshes_changed_firmware_level() {
    let fleet = TestFleet::new().await;
    let device = fleet.device("edge-1", "10.0.0.1").await;
    let daemon = ReconciliationDaemon::new(
        HeartbeatReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );

    fleet.sim.set_firmware_level("10.0.0.1", "7.9").await;
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.corrected, 1);

    eventually("refreshed firmware level", || {
        let device = device.clone();
        async move {
            device
                .read(|s| s.firmware_level.as_deref() == Some("7.9"))
                .await
                .unwrap()
        }
    })
    .await;
}

#[tokio::test]
async fn test_heartbeat_suspends_unreachable_device() {
    let fleet = TestFleet::new().await;
    let device = fleet.device("edge-1", "10.0.0.1").await;
    let daemon = ReconciliationDaemon::new(
        HeartbeatReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );

    fleet.sim.set_reachable("10.0.0.1", false).await;
    for round in 1..=3 {
        let summary = daemon.tick().await.unwrap();
        assert_eq!(summary.failed, 1, "round {}", round);
        assert_eq!(daemon.failure_count(device.handle()).await, round);
    }
    assert_eq!(daemon.suspended().await, vec![device.handle().clone()]);
    assert_eq!(
        device.read(|s| s.status).await.unwrap(),
        OperationalStatus::Unreachable
    );

    // Suspended: the fourth tick does not probe the device.
    let probes = fleet.sim.probe_count("10.0.0.1").await;
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.probed, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(fleet.sim.probe_count("10.0.0.1").await, probes);

    // Reset re-enables probing; the device is back up.
    fleet.sim.set_reachable("10.0.0.1", true).await;
    assert!(daemon.reset(device.handle()).await);
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.in_sync, 1);
    assert_eq!(fleet.sim.probe_count("10.0.0.1").await, probes + 1);
    assert_eq!(daemon.failure_count(device.handle()).await, 0);
    assert_eq!(device.read(|s| s.status).await.unwrap(), OperationalStatus::Up);
}

#[tokio::test]
async fn test_heartbeat_skips_busy_device() {
    let fleet = TestFleet::new().await;
    let device = fleet.device("edge-1", "10.0.0.1").await;
    let daemon = ReconciliationDaemon::new(
        HeartbeatReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );

    let probes = fleet.sim.probe_count("10.0.0.1").await;
    let guard = device.resource_lock().lock_no_wait().unwrap();
    let summary = daemon.tick().await.unwrap();
    guard.unlock();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.probed, 0);
    assert_eq!(fleet.sim.probe_count("10.0.0.1").await, probes);
}

#[tokio::test]
async fn test_heartbeat_ignores_unsubscribed_devices() {
    let fleet = TestFleet::new().await;
    let device = fleet.device("edge-1", "10.0.0.1").await;
    let progress = fleet.manager.unsubscribe(device.handle()).await.unwrap();
    assert_eq!(finish(&progress).await, ProgressStatus::Complete);

    let daemon = ReconciliationDaemon::new(
        HeartbeatReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.probed, 0);
    assert_eq!(summary.skipped, 0);
}

#[tokio::test]
async fn test_heartbeat_records_outcomes() {
    let fleet = TestFleet::new().await;
    fleet.device("edge-1", "10.0.0.1").await;
    fleet.device("edge-2", "10.0.0.2").await;
    let daemon = ReconciliationDaemon::new(
        HeartbeatReconciler::new(fleet.manager.clone()),
        ReconcileConfig {
            record_outcomes: true,
            ..daemon_config()
        },
    );

    fleet.sim.set_reachable("10.0.0.2", false).await;
    daemon.tick().await.unwrap();

    let outcomes = daemon.outcomes().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes.iter().filter(|o| o.has_error()).count(), 1);
}

// ============================================================================
// Domain Sync
// ============================================================================

#[tokio::test]
async fn test_domain_sync_redeploys_drifted_domain() {
    let fleet = TestFleet::new().await;
    let device = fleet.device("edge-1", "10.0.0.1").await;
    let domain = fleet
        .manager
        .add_domain(device.handle(), "routing", true)
        .await
        .unwrap();
    fleet
        .manager
        .add_domain_version(domain.handle(), "v1", b"router bgp 65001".to_vec())
        .await
        .unwrap();
    let deployed = fleet
        .manager
        .deploy_domain(domain.handle(), None)
        .await
        .unwrap();
    assert_eq!(finish(&deployed).await, ProgressStatus::Complete);

    let daemon = ReconciliationDaemon::new(
        DomainSyncReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.in_sync, 1);

    fleet
        .sim
        .tamper_domain("10.0.0.1", "routing", b"router bgp 666")
        .await;
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.corrected, 1);

    eventually("redeploy", || async {
        fleet.sim.domain_payload("10.0.0.1", "routing").await
            == Some(b"router bgp 65001".to_vec())
    })
    .await;

    // Once the correction has finished the domain probes in sync again.
    eventually("in-sync probe", || async {
        daemon.tick().await.map(|s| s.in_sync == 1).unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_domain_sync_deploys_pending_desired_version() {
    let fleet = TestFleet::new().await;
    let device = fleet.device("edge-1", "10.0.0.1").await;
    let domain = fleet
        .manager
        .add_domain(device.handle(), "acl", true)
        .await
        .unwrap();
    let (record, _) = fleet
        .manager
        .add_domain_version(domain.handle(), "v1", b"permit any".to_vec())
        .await
        .unwrap();

    let daemon = ReconciliationDaemon::new(
        DomainSyncReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.corrected, 1);

    eventually("deployed version", || {
        let domain = domain.clone();
        async move {
            domain
                .read(|d| d.deployed_version == Some(record.version))
                .await
                .unwrap()
        }
    })
    .await;
}

#[tokio::test]
async fn test_domain_sync_ignores_manual_and_unreachable() {
    let fleet = TestFleet::new().await;
    let manual_device = fleet.device("edge-1", "10.0.0.1").await;
    let manual = fleet
        .manager
        .add_domain(manual_device.handle(), "routing", false)
        .await
        .unwrap();
    fleet
        .manager
        .add_domain_version(manual.handle(), "v1", b"a".to_vec())
        .await
        .unwrap();

    let down_device = fleet.device("edge-2", "10.0.0.2").await;
    let auto = fleet
        .manager
        .add_domain(down_device.handle(), "routing", true)
        .await
        .unwrap();
    fleet
        .manager
        .add_domain_version(auto.handle(), "v1", b"b".to_vec())
        .await
        .unwrap();
    fleet.sim.set_reachable("10.0.0.2", false).await;
    let refreshed = fleet
        .manager
        .refresh_device_info(down_device.handle())
        .await
        .unwrap();
    assert_eq!(finish(&refreshed).await, ProgressStatus::Error);

    let daemon = ReconciliationDaemon::new(
        DomainSyncReconciler::new(fleet.manager.clone()),
        daemon_config(),
    );
    let summary = daemon.tick().await.unwrap();
    assert_eq!(summary.probed, 0);
    assert_eq!(summary.skipped, 0);
}

// ============================================================================
// Daemon loop
// ============================================================================

#[tokio::test]
async fn test_daemon_loop_corrects_and_stops() {
    let fleet = TestFleet::new().await;
    fleet.device("edge-1", "10.0.0.1").await;
    let daemon = std::sync::Arc::new(ReconciliationDaemon::new(
        HeartbeatReconciler::new(fleet.manager.clone()),
        daemon_config(),
    ));
    let shutdown = daemon.shutdown_handle();
    let runner = daemon.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    fleet.sim.drop_subscription("10.0.0.1").await;
    eventually("resubscription", || fleet.sim.is_subscribed("10.0.0.1")).await;

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap();
}
