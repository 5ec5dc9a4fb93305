// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the queue processor - per-area serialization, FIFO order,
//! capacity, failure capture and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetward_core::{
    BackgroundTask, Error, MacroProgressContainer, ProgressStatus, QueueProcessor,
    QueueProcessorConfig, WorkAreaId,
};
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

fn ms(name: &str) -> WorkAreaId {
    WorkAreaId::managed_set(name)
}

/// A task that blocks until `gate` is notified.
fn gated(kind: &str, gate: Arc<Notify>) -> BackgroundTask {
    BackgroundTask::from_fn(kind.to_string(), "device:gated", move |_| async move {
        gate.notified().await;
        Ok(None)
    })
}

fn noop(kind: &str) -> BackgroundTask {
    BackgroundTask::from_fn(kind.to_string(), "device:noop", |_| async { Ok(None) })
}

async fn processor_with(areas: &[(WorkAreaId, Option<usize>)]) -> Arc<QueueProcessor> {
    let processor = QueueProcessor::new(QueueProcessorConfig::default());
    for (id, capacity) in areas {
        processor
            .register_work_area(id.clone(), *capacity)
            .await
            .expect("register work area");
    }
    processor
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_task_per_work_area() {
    let processor = processor_with(&[(ms("ms1"), None), (ms("ms2"), None)]).await;

    let mut progresses = Vec::new();
    let mut trackers = Vec::new();
    for area in ["ms1", "ms2"] {
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let task = BackgroundTask::from_fn(format!("job-{}", i), area, move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(None)
            });
            progresses.push(processor.enqueue(task, &ms(area)).await.unwrap());
        }
        trackers.push(max_seen);
    }

    for p in &progresses {
        assert_eq!(p.wait_timeout(WAIT).await.unwrap(), ProgressStatus::Complete);
    }
    for max_seen in trackers {
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
    processor.shutdown().await;
}

#[tokio::test]
async fn test_fifo_within_work_area() {
    let processor = processor_with(&[(WorkAreaId::Manager, None)]).await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut last = None;
    for i in 0..20u32 {
        let order = order.clone();
        let task = BackgroundTask::from_fn("record", "manager", move |_| async move {
            order.lock().unwrap().push(i);
            Ok(None)
        });
        last = Some(processor.enqueue(task, &WorkAreaId::Manager).await.unwrap());
    }
    last.unwrap().wait_timeout(WAIT).await.unwrap();

    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<u32>>());
    processor.shutdown().await;
}

#[tokio::test]
async fn test_capacity_full_until_dequeue() {
    let area = ms("small");
    let processor = processor_with(&[(area.clone(), Some(2))]).await;

    let gate = Arc::new(Notify::new());
    let running = processor
        .enqueue(gated("blocker", gate.clone()), &area)
        .await
        .unwrap();
    running.wait_started().await;

    let second_gate = Arc::new(Notify::new());
    let second = processor
        .enqueue(gated("second", second_gate.clone()), &area)
        .await
        .unwrap();
    processor.enqueue(noop("third"), &area).await.unwrap();

    let err = processor.enqueue(noop("overflow"), &area).await.unwrap_err();
    assert!(matches!(err, Error::Full { capacity: 2, .. }));
    assert_eq!(err.error_code(), "FULL");

    let work_area = processor.work_area(&area).await.unwrap();
    assert_eq!(work_area.size().await, 2);
    assert_eq!(work_area.peek(0).await.unwrap().kind, "second");

    gate.notify_one();
    second.wait_started().await;
    processor
        .enqueue(noop("fits-now"), &area)
        .await
        .expect("dequeue freed a slot");

    second_gate.notify_one();
    processor.shutdown().await;

    let stats = work_area.stats().await;
    assert_eq!(stats.rejected, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_work_areas_run_in_parallel() {
    let processor = processor_with(&[(ms("MS1"), None), (ms("MS2"), None)]).await;

    let gate_a = Arc::new(Notify::new());
    let a = processor
        .enqueue(gated("A", gate_a.clone()), &ms("MS1"))
        .await
        .unwrap();
    a.wait_started().await;

    let a_seen_by_b = a.clone();
    let b_observed = Arc::new(Mutex::new(None));
    let b_slot = b_observed.clone();
    let b_task = BackgroundTask::from_fn("B", "device:b", move |_| async move {
        *b_slot.lock().unwrap() = Some(a_seen_by_b.status());
        Ok(None)
    });
    let b = processor.enqueue(b_task, &ms("MS1")).await.unwrap();
    let c = processor.enqueue(noop("C"), &ms("MS2")).await.unwrap();

    assert_eq!(c.wait_timeout(WAIT).await.unwrap(), ProgressStatus::Complete);
    assert_eq!(a.status(), ProgressStatus::InProgress);
    assert_eq!(b.status(), ProgressStatus::Pending);

    gate_a.notify_one();
    assert_eq!(b.wait_timeout(WAIT).await.unwrap(), ProgressStatus::Complete);
    assert_eq!(*b_observed.lock().unwrap(), Some(ProgressStatus::Complete));

    processor.shutdown().await;
}

#[tokio::test]
async fn test_failures_are_captured() {
    let processor = processor_with(&[(WorkAreaId::Manager, None)]).await;

    let failing = BackgroundTask::from_fn("busy", "device:x", |_| async {
        Err(Error::Busy {
            resource: "device:x".to_string(),
        })
    });
    let panicking = BackgroundTask::from_fn("explode", "device:y", |_| async {
        let explode = true;
        if explode {
            panic!("boom");
        }
        Ok(None)
    });

    let p1 = processor
        .enqueue(failing, &WorkAreaId::Manager)
        .await
        .unwrap();
    let p2 = processor
        .enqueue(panicking, &WorkAreaId::Manager)
        .await
        .unwrap();
    let p3 = processor
        .enqueue(noop("after"), &WorkAreaId::Manager)
        .await
        .unwrap();

    assert_eq!(p3.wait_timeout(WAIT).await.unwrap(), ProgressStatus::Complete);

    assert!(p1.has_error());
    assert_eq!(p1.error().unwrap().error_code(), "BUSY");
    assert!(p2.has_error());
    assert!(matches!(*p2.error().unwrap(), Error::TaskPanicked(ref k) if k == "explode"));

    processor.shutdown().await;
    let stats = processor.stats().await;
    assert_eq!(stats[0].failed, 2);
    assert_eq!(stats[0].completed, 1);
}

#[tokio::test]
async fn test_shutdown_discards_ordinary_and_runs_privileged() {
    let processor = processor_with(&[(WorkAreaId::Manager, None)]).await;

    let gate = Arc::new(Notify::new());
    let in_flight = processor
        .enqueue(gated("in-flight", gate.clone()), &WorkAreaId::Manager)
        .await
        .unwrap();
    in_flight.wait_started().await;

    let queued_a = processor
        .enqueue(noop("queued-a"), &WorkAreaId::Manager)
        .await
        .unwrap();
    let queued_b = processor
        .enqueue(noop("queued-b"), &WorkAreaId::Manager)
        .await
        .unwrap();

    processor.begin_shutdown().await;
    assert!(!processor.is_accepting());
    let err = processor
        .enqueue(noop("late"), &WorkAreaId::Manager)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown(_)));

    let unsubscribe = processor
        .privileged_enqueue(noop("unsubscribe_all"), &WorkAreaId::Manager)
        .await;

    gate.notify_one();
    processor.shutdown().await;

    assert_eq!(in_flight.status(), ProgressStatus::Complete);
    assert_eq!(unsubscribe.status(), ProgressStatus::Complete);
    for discarded in [&queued_a, &queued_b] {
        assert_eq!(discarded.status(), ProgressStatus::Error);
        assert_eq!(discarded.error().unwrap().error_code(), "SHUTTING_DOWN");
    }

    let stats = processor.stats().await;
    assert_eq!(stats[0].discarded, 2);
}

#[tokio::test]
async fn test_privileged_enqueue_ignores_capacity() {
    let area = ms("tiny");
    let processor = processor_with(&[(area.clone(), Some(1))]).await;

    let gate = Arc::new(Notify::new());
    let blocker = processor
        .enqueue(gated("blocker", gate.clone()), &area)
        .await
        .unwrap();
    blocker.wait_started().await;
    processor.enqueue(noop("fills"), &area).await.unwrap();

    let privileged = processor.privileged_enqueue(noop("system"), &area).await;
    gate.notify_one();
    assert_eq!(
        privileged.wait_timeout(WAIT).await.unwrap(),
        ProgressStatus::Complete
    );
    processor.shutdown().await;
}

#[tokio::test]
async fn test_unregister_drains_work_area() {
    let area = ms("retired");
    let processor = processor_with(&[(area.clone(), None)]).await;

    let gate = Arc::new(Notify::new());
    let running = processor
        .enqueue(gated("running", gate.clone()), &area)
        .await
        .unwrap();
    running.wait_started().await;
    let queued = processor.enqueue(noop("queued"), &area).await.unwrap();

    let unregister = {
        let processor = processor.clone();
        let area = area.clone();
        tokio::spawn(async move { processor.unregister_work_area(&area).await })
    };
    let work_area = processor.work_area(&area).await.unwrap();
    while !work_area.is_closing().await {
        tokio::task::yield_now().await;
    }
    gate.notify_one();
    unregister.await.unwrap().unwrap();

    assert_eq!(running.status(), ProgressStatus::Complete);
    assert_eq!(queued.status(), ProgressStatus::Error);
    assert!(processor.work_area(&area).await.is_none());

    let err = processor.enqueue(noop("gone"), &area).await.unwrap_err();
    assert!(matches!(err, Error::UnknownWorkArea(_)));
}

#[tokio::test]
async fn test_macro_container_groups_tasks() {
    let processor = processor_with(&[(ms("ms1"), None), (ms("ms2"), None)]).await;
    let group = MacroProgressContainer::new("load_all");

    group.add_child(processor.enqueue(noop("load-1"), &ms("ms1")).await.unwrap());
    let failing = BackgroundTask::from_fn("load-2", "device:bad", |_| async {
        Err(Error::store("get", "row missing"))
    });
    group.add_child(processor.enqueue(failing, &ms("ms2")).await.unwrap());

    group.wait_children().await;
    assert!(!group.is_complete());
    assert!(group.mark_complete());

    assert!(group.is_complete());
    assert!(group.has_error());
    assert_eq!(group.failed_children().len(), 1);
    assert_eq!(group.finished_children(), 2);

    processor.shutdown().await;
}
