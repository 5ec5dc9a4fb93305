// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded version retention.
//!
//! [`trim_versions`] walks a versioned entity's history oldest-first and
//! deletes versions that are not in use until at most `max_versions` remain.
//! In-use versions are never deleted, so an entity may keep more than the
//! maximum when the excess is in use.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;

/// An entity with an ordered version history.
#[async_trait]
pub trait Versioned: Send + Sync {
    /// Identity used in log records.
    fn version_owner(&self) -> String;

    /// Stored version numbers. Need not be sorted.
    async fn version_numbers(&self) -> Result<Vec<u32>>;

    /// Whether `version` must be kept.
    async fn is_version_in_use(&self, version: u32) -> Result<bool>;

    /// Delete one version.
    async fn delete_version(&self, version: u32) -> Result<()>;
}

/// Outcome of one trim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    /// Versions deleted, oldest first.
    pub deleted: Vec<u32>,
    /// Versions examined and kept because they are in use.
    pub retained_in_use: Vec<u32>,
    /// Versions whose deletion failed.
    pub failed: Vec<u32>,
    /// Versions held after the trim.
    pub remaining: usize,
}

/// Trim `entity` to at most `max_versions` versions.
///
/// Deletion failures are logged and skipped; only a failure to list the
/// versions is returned as an error. An in-use check that fails counts as
/// in use.
pub async fn trim_versions<V>(entity: &V, max_versions: usize) -> Result<RetentionReport>
where
    V: Versioned + ?Sized,
{
    let mut versions = entity.version_numbers().await?;
    versions.sort_unstable();
    versions.dedup();

    let mut report = RetentionReport {
        remaining: versions.len(),
        ..Default::default()
    };
    if versions.len() <= max_versions {
        return Ok(report);
    }

    let owner = entity.version_owner();
    for version in versions {
        if report.remaining <= max_versions {
            break;
        }
        let in_use = match entity.is_version_in_use(version).await {
            Ok(in_use) => in_use,
            Err(e) => {
                warn!(owner = %owner, version, error = %e, "In-use check failed, keeping version");
                true
            }
        };
        if in_use {
            debug!(owner = %owner, version, "Keeping in-use version");
            report.retained_in_use.push(version);
            continue;
        }
        match entity.delete_version(version).await {
            Ok(()) => {
                report.remaining -= 1;
                report.deleted.push(version);
            }
            Err(e) => {
                warn!(owner = %owner, version, error = %e, "Failed to delete version");
                report.failed.push(version);
            }
        }
    }

    if !report.deleted.is_empty() {
        info!(
            owner = %owner,
            deleted = report.deleted.len(),
            remaining = report.remaining,
            "Trimmed version history"
        );
    }
    Ok(report)
}
