// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable storage collaborator.
//!
//! Entities are stored as opaque JSON bodies keyed by [`EntityHandle`], with
//! an optimistic revision counter. Versioned entities additionally own an
//! ordered list of [`VersionRecord`]s whose numbers are never reused.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetward_core::{EntityHandle, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Kind of a stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A network appliance.
    Device,
    /// A group of devices sharing one work area.
    ManagedSet,
    /// A configuration domain on a device.
    Domain,
    /// Firmware images for one device model.
    Firmware,
}

impl EntityKind {
    /// Stable string form, used as the database column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Device => "device",
            EntityKind::ManagedSet => "managed_set",
            EntityKind::Domain => "domain",
            EntityKind::Firmware => "firmware",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "device" => Ok(EntityKind::Device),
            "managed_set" => Ok(EntityKind::ManagedSet),
            "domain" => Ok(EntityKind::Domain),
            "firmware" => Ok(EntityKind::Firmware),
            other => Err(Error::store(
                "decode",
                format!("unknown entity kind '{}'", other),
            )),
        }
    }
}

/// A stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Durable handle.
    pub handle: EntityHandle,
    /// Entity kind.
    pub kind: EntityKind,
    /// Optimistic revision, starting at 1.
    pub revision: i64,
    /// Serialized entity state.
    pub body: Value,
    /// When the entity was created.
    pub created_at: DateTime<Utc>,
    /// When the entity was last saved.
    pub updated_at: DateTime<Utc>,
}

/// One stored version of a versioned entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionRecord {
    /// Owning entity.
    pub owner: EntityHandle,
    /// Version number, increasing per owner.
    pub version: u32,
    /// Human-readable label (firmware level, domain revision name, ...).
    pub label: String,
    /// Version contents.
    #[serde(skip)]
    pub payload: Vec<u8>,
    /// SHA-256 of the payload, hex encoded.
    pub checksum: String,
    /// When the version was added.
    pub created_at: DateTime<Utc>,
}

/// Hex-encoded SHA-256 of `payload`.
pub fn checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// Durable storage for fleet entities.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new entity under a freshly allocated handle.
    async fn create(&self, kind: EntityKind, body: Value) -> Result<EntityRecord>;

    /// Load an entity, `None` if it does not exist.
    async fn get(&self, handle: &EntityHandle) -> Result<Option<EntityRecord>>;

    /// All entities of a kind, ordered by creation.
    async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>>;

    /// Save `body` if the stored revision equals `expected_revision`.
    ///
    /// Returns the new revision. Fails with `Conflict` on mismatch and
    /// `Deleted` if the entity no longer exists.
    async fn save(
        &self,
        handle: &EntityHandle,
        expected_revision: i64,
        body: Value,
    ) -> Result<i64>;

    /// Save `body` regardless of the stored revision.
    async fn save_forced(&self, handle: &EntityHandle, body: Value) -> Result<i64>;

    /// Delete an entity and its versions. Returns false if it did not exist.
    async fn delete(&self, handle: &EntityHandle) -> Result<bool>;

    /// Append a version to `owner`'s history.
    async fn add_version(
        &self,
        owner: &EntityHandle,
        label: &str,
        payload: Vec<u8>,
    ) -> Result<VersionRecord>;

    /// `owner`'s versions, oldest first.
    async fn list_versions(&self, owner: &EntityHandle) -> Result<Vec<VersionRecord>>;

    /// One version, `None` if it does not exist.
    async fn get_version(&self, owner: &EntityHandle, version: u32)
    -> Result<Option<VersionRecord>>;

    /// Delete one version. Returns false if it did not exist.
    async fn delete_version(&self, owner: &EntityHandle, version: u32) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_round_trip() {
        for kind in [
            EntityKind::Device,
            EntityKind::ManagedSet,
            EntityKind::Domain,
            EntityKind::Firmware,
        ] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("router".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        let sum = checksum(b"hostname edge-1\n");
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sum, checksum(b"hostname edge-1\n"));
        assert_ne!(sum, checksum(b"hostname edge-2\n"));
    }
}
