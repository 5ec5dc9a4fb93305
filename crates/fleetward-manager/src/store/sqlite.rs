// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetward_core::{EntityHandle, Error as CoreError, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{EntityKind, EntityRecord, Store, VersionRecord, checksum};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    handle: String,
    kind: String,
    revision: i64,
    body: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntityRow> for EntityRecord {
    type Error = CoreError;

    fn try_from(row: EntityRow) -> Result<Self> {
        Ok(EntityRecord {
            handle: EntityHandle::new(row.handle),
            kind: row.kind.parse()?,
            revision: row.revision,
            body: serde_json::from_str(&row.body)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    owner: String,
    version: i64,
    label: String,
    payload: Vec<u8>,
    checksum: String,
    created_at: DateTime<Utc>,
}

impl From<VersionRow> for VersionRecord {
    fn from(row: VersionRow) -> Self {
        VersionRecord {
            owner: EntityHandle::new(row.owner),
            version: row.version as u32,
            label: row.label,
            payload: row.payload,
            checksum: row.checksum,
            created_at: row.created_at,
        }
    }
}

fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> CoreError {
    move |e| CoreError::store(operation, e)
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> crate::error::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// Parent directories are created if they don't exist.
    pub async fn from_path(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Connect using a URL of the form `sqlite:<path>?...`, creating the
    /// parent directory of file-backed databases.
    pub async fn open(url: &str) -> crate::error::Result<Self> {
        if let Some(rest) = url.strip_prefix("sqlite:") {
            let path = rest.split('?').next().unwrap_or_default();
            if !path.is_empty()
                && !path.starts_with(':')
                && let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::connect(url).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn current_revision(&self, handle: &EntityHandle) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT revision FROM entities WHERE handle = ?")
            .bind(handle.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_revision"))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create(&self, kind: EntityKind, body: Value) -> Result<EntityRecord> {
        let handle = EntityHandle::generate();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO entities (handle, kind, revision, version_seq, body, created_at, updated_at)
            VALUES (?, ?, 1, 0, ?, ?, ?)
            "#,
        )
        .bind(handle.as_str())
        .bind(kind.as_str())
        .bind(body.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("create"))?;

        Ok(EntityRecord {
            handle,
            kind,
            revision: 1,
            body,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, handle: &EntityHandle) -> Result<Option<EntityRecord>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT handle, kind, revision, body, created_at, updated_at
            FROM entities
            WHERE handle = ?
            "#,
        )
        .bind(handle.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get"))?;

        row.map(EntityRecord::try_from).transpose()
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT handle, kind, revision, body, created_at, updated_at
            FROM entities
            WHERE kind = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list"))?;

        rows.into_iter().map(EntityRecord::try_from).collect()
    }

    async fn save(
        &self,
        handle: &EntityHandle,
        expected_revision: i64,
        body: Value,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            UPDATE entities
            SET body = ?, revision = revision + 1, updated_at = ?
            WHERE handle = ? AND revision = ?
            "#,
        )
        .bind(body.to_string())
        .bind(Utc::now())
        .bind(handle.as_str())
        .bind(expected_revision)
        .execute(&self.pool)
        .await
        .map_err(db_err("save"))?;

        if result.rows_affected() == 1 {
            return Ok(expected_revision + 1);
        }
        match self.current_revision(handle).await? {
            Some(actual) => Err(CoreError::Conflict {
                handle: handle.to_string(),
                expected: expected_revision,
                actual,
            }),
            None => Err(CoreError::Deleted {
                handle: handle.to_string(),
            }),
        }
    }

    async fn save_forced(&self, handle: &EntityHandle, body: Value) -> Result<i64> {
        let revision = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE entities
            SET body = ?, revision = revision + 1, updated_at = ?
            WHERE handle = ?
            RETURNING revision
            "#,
        )
        .bind(body.to_string())
        .bind(Utc::now())
        .bind(handle.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("save_forced"))?;

        revision.ok_or_else(|| CoreError::Deleted {
            handle: handle.to_string(),
        })
    }

    async fn delete(&self, handle: &EntityHandle) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err("delete"))?;
        sqlx::query("DELETE FROM entity_versions WHERE owner = ?")
            .bind(handle.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err("delete"))?;
        let result = sqlx::query("DELETE FROM entities WHERE handle = ?")
            .bind(handle.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err("delete"))?;
        tx.commit().await.map_err(db_err("delete"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_version(
        &self,
        owner: &EntityHandle,
        label: &str,
        payload: Vec<u8>,
    ) -> Result<VersionRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err("add_version"))?;

        let version = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE entities
            SET version_seq = version_seq + 1
            WHERE handle = ?
            RETURNING version_seq
            "#,
        )
        .bind(owner.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("add_version"))?
        .ok_or_else(|| CoreError::Deleted {
            handle: owner.to_string(),
        })?;

        let record = VersionRecord {
            owner: owner.clone(),
            version: version as u32,
            label: label.to_string(),
            checksum: checksum(&payload),
            payload,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO entity_versions (owner, version, label, payload, checksum, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(owner.as_str())
        .bind(version)
        .bind(&record.label)
        .bind(&record.payload)
        .bind(&record.checksum)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("add_version"))?;

        tx.commit().await.map_err(db_err("add_version"))?;
        Ok(record)
    }

    async fn list_versions(&self, owner: &EntityHandle) -> Result<Vec<VersionRecord>> {
        if self.current_revision(owner).await?.is_none() {
            return Err(CoreError::Deleted {
                handle: owner.to_string(),
            });
        }
        let rows = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT owner, version, label, payload, checksum, created_at
            FROM entity_versions
            WHERE owner = ?
            ORDER BY version
            "#,
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_versions"))?;

        Ok(rows.into_iter().map(VersionRecord::from).collect())
    }

    async fn get_version(
        &self,
        owner: &EntityHandle,
        version: u32,
    ) -> Result<Option<VersionRecord>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT owner, version, label, payload, checksum, created_at
            FROM entity_versions
            WHERE owner = ? AND version = ?
            "#,
        )
        .bind(owner.as_str())
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_version"))?;

        Ok(row.map(VersionRecord::from))
    }

    async fn delete_version(&self, owner: &EntityHandle, version: u32) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entity_versions WHERE owner = ? AND version = ?")
            .bind(owner.as_str())
            .bind(version as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_version"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Create an in-memory SQLite pool for testing.
    async fn test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = test_store().await;
        let rec = store
            .create(EntityKind::Device, json!({"name": "edge-1", "address": "10.0.0.1"}))
            .await
            .expect("Failed to create entity");

        let loaded = store
            .get(&rec.handle)
            .await
            .expect("Failed to get entity")
            .expect("Entity should exist");

        assert_eq!(loaded.kind, EntityKind::Device);
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.body["address"], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let store = test_store().await;
        let result = store
            .get(&EntityHandle::from("nonexistent"))
            .await
            .expect("Query should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_list_by_kind() {
        let store = test_store().await;
        let a = store.create(EntityKind::Device, json!({"n": 1})).await.unwrap();
        store
            .create(EntityKind::Firmware, json!({"model": "x"}))
            .await
            .unwrap();
        let b = store.create(EntityKind::Device, json!({"n": 2})).await.unwrap();

        let devices = store.list(EntityKind::Device).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].handle, a.handle);
        assert_eq!(devices[1].handle, b.handle);
    }

    #[tokio::test]
    async fn test_save_conflict_and_deleted() {
        let store = test_store().await;
        let rec = store.create(EntityKind::Domain, json!({})).await.unwrap();

        assert_eq!(store.save(&rec.handle, 1, json!({"a": 1})).await.unwrap(), 2);

        let err = store
            .save(&rec.handle, 1, json!({"a": 2}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        assert_eq!(
            store.save_forced(&rec.handle, json!({"a": 3})).await.unwrap(),
            3
        );
        let loaded = store.get(&rec.handle).await.unwrap().unwrap();
        assert_eq!(loaded.body["a"], 3);

        assert!(store.delete(&rec.handle).await.unwrap());
        let err = store.save(&rec.handle, 3, json!({})).await.unwrap_err();
        assert!(err.is_deleted());
        let err = store.save_forced(&rec.handle, json!({})).await.unwrap_err();
        assert!(err.is_deleted());
    }

    #[tokio::test]
    async fn test_versions() {
        let store = test_store().await;
        let fw = store.create(EntityKind::Firmware, json!({})).await.unwrap();

        for level in ["7.0", "7.1", "7.2"] {
            store
                .add_version(&fw.handle, level, level.as_bytes().to_vec())
                .await
                .unwrap();
        }
        assert!(store.delete_version(&fw.handle, 1).await.unwrap());
        assert!(!store.delete_version(&fw.handle, 1).await.unwrap());

        let next = store
            .add_version(&fw.handle, "7.3", b"7.3".to_vec())
            .await
            .unwrap();
        assert_eq!(next.version, 4);

        let versions = store.list_versions(&fw.handle).await.unwrap();
        let numbers: Vec<u32> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
        assert_eq!(versions[0].label, "7.1");
        assert_eq!(versions[0].checksum, checksum(b"7.1"));

        let v3 = store.get_version(&fw.handle, 3).await.unwrap().unwrap();
        assert_eq!(v3.payload, b"7.2".to_vec());

        assert!(store.delete(&fw.handle).await.unwrap());
        assert!(store.list_versions(&fw.handle).await.unwrap_err().is_deleted());
    }

    #[tokio::test]
    async fn test_add_version_to_missing_owner() {
        let store = test_store().await;
        let err = store
            .add_version(&EntityHandle::from("missing"), "1", vec![1])
            .await
            .unwrap_err();
        assert!(err.is_deleted());
    }

    #[tokio::test]
    async fn test_from_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet.db");
        let store = SqliteStore::from_path(&path).await.unwrap();
        let rec = store.create(EntityKind::ManagedSet, json!({})).await.unwrap();
        drop(store);

        let reopened = SqliteStore::from_path(&path).await.unwrap();
        assert!(reopened.get(&rec.handle).await.unwrap().is_some());
    }
}
