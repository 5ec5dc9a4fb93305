// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetward Core - Task-Scheduling Engine
//!
//! This crate provides the concurrency primitives the fleet manager is built
//! on. It knows nothing about devices; it serializes work per resource,
//! reports progress asynchronously, and maps durable handles to live objects.
//!
//! # Architecture
//!
//! ```text
//!   caller / daemon
//!        │ enqueue(task, work_area)
//!        ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     QueueProcessor                        │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐         │
//! │  │ WorkArea   │   │ WorkArea   │   │ WorkArea   │   ...   │
//! │  │ "manager"  │   │ "ms:edge"  │   │ "ms:core"  │         │
//! │  │ TaskQueue  │   │ TaskQueue  │   │ TaskQueue  │         │
//! │  │ worker     │   │ worker     │   │ worker     │         │
//! │  └────────────┘   └────────────┘   └────────────┘         │
//! └──────────────────────────────────────────────────────────┘
//!        │ one task at a time per area, areas in parallel
//!        ▼
//!   ProgressContainer  (PENDING → IN_PROGRESS → COMPLETE | ERROR)
//! ```
//!
//! # Components
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`lock`] | Per-resource exclusive locks with a global rank order |
//! | [`progress`] | Progress containers and macro (grouping) containers |
//! | [`task`] | Background tasks bound to a target resource |
//! | [`queue`] | Capacity-bounded FIFO of tasks |
//! | [`work_area`] | Serialization domains owning one queue |
//! | [`processor`] | Scheduler running one worker per work area |
//! | [`mapper`] | Identity map from durable handles to live objects |
//! | [`retention`] | Bounded version-history trimming |
//!
//! # Example
//!
//! ```no_run
//! use fleetward_core::{BackgroundTask, QueueProcessor, QueueProcessorConfig, WorkAreaId};
//!
//! # async fn example() -> fleetward_core::Result<()> {
//! let processor = QueueProcessor::new(QueueProcessorConfig::default());
//! processor.register_work_area(WorkAreaId::managed_set("edge"), Some(16)).await?;
//!
//! let task = BackgroundTask::from_fn("backup", "device:r1", |progress| async move {
//!     progress.set_total_steps(1);
//!     progress.increment_current_step(1, "backup taken");
//!     Ok(None)
//! });
//! let progress = processor.enqueue(task, &WorkAreaId::managed_set("edge")).await?;
//! progress.wait().await;
//! assert!(!progress.has_error());
//!
//! processor.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod lock;
pub mod mapper;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod retention;
pub mod task;
pub mod work_area;

pub use error::{Error, ErrorClass, Result};
pub use lock::{LockGuard, LockRank, Lockable, ResourceLock, lock_ordered};
pub use mapper::{EntityHandle, Liveness, Persistable, PersistenceMapper};
pub use processor::{QueueProcessor, QueueProcessorConfig};
pub use progress::{MacroProgressContainer, ProgressContainer, ProgressSnapshot, ProgressStatus};
pub use queue::TaskQueue;
pub use retention::{RetentionReport, Versioned, trim_versions};
pub use task::{BackgroundTask, TaskOperation, TaskOrigin, TaskSummary};
pub use work_area::{WorkArea, WorkAreaId, WorkAreaStats};
