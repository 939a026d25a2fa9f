//! Persistent store interface and its two implementations.
//!
//! - `PostgresRecordStore`: primary store (`storage_records` table)
//! - `SqliteDocumentStore`: backup document store (`storage_documents`)
//!
//! Both go through their backend's `ConnectionManager`: every call first runs
//! `ensure_connection`, then executes against a pooled session.
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::repos::{document_repo, record_repo};
use crate::services::connection::{
    ConnectionError, ConnectionManager, PostgresConnector, SqliteConnector,
};
use crate::services::retry::Retryable;
use crate::services::storage::record::{self, PersistentRecord};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    // Connectivity: refused, timed out, closed, not connected.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    // Schema/validation/constraint problems; retrying will not help.
    #[error("store rejected the operation: {0}")]
    Rejected(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<ConnectionError> for StoreError {
    fn from(e: ConnectionError) -> Self {
        if e.is_retryable() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Rejected(e.to_string())
        }
    }
}

/// Minimum operation set every persistent backend supports.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    fn backend_name(&self) -> &'static str;

    // Current reachability, from local state only (no I/O).
    async fn is_available(&self) -> bool;

    // Lookup by key, skipping expired records.
    async fn get(&self, key: &str) -> StoreResult<Option<PersistentRecord>>;

    // Unique-key upsert. Never fails with a duplicate-key error.
    async fn upsert(&self, key: &str, value: &Value, ttl: Option<Duration>) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    // Remove every record. Returns the number removed.
    async fn truncate(&self) -> StoreResult<u64>;

    async fn purge_expired(&self) -> StoreResult<u64>;
}

pub struct PostgresRecordStore {
    manager: ConnectionManager<PostgresConnector>,
}

impl PostgresRecordStore {
    pub fn new(manager: ConnectionManager<PostgresConnector>) -> Self {
        Self { manager }
    }

    async fn ready(&self) -> StoreResult<()> {
        if self.manager.ensure_connection().await {
            Ok(())
        } else {
            Err(StoreError::Unavailable("postgres is not reachable".into()))
        }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    fn backend_name(&self) -> &'static str {
        self.manager.backend_name()
    }

    async fn is_available(&self) -> bool {
        self.manager.is_connected().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<PersistentRecord>> {
        self.ready().await?;
        let row = self
            .manager
            .execute(|pool| async move {
                record_repo::find_active(&pool, key, Utc::now())
                    .await
                    .map_err(ConnectionError::from)
            })
            .await?;
        Ok(row.map(PersistentRecord::from))
    }

    async fn upsert(&self, key: &str, value: &Value, ttl: Option<Duration>) -> StoreResult<()> {
        self.ready().await?;
        self.manager
            .execute(|pool| async move {
                let now = Utc::now();
                let ttl_seconds = record::ttl_seconds(ttl);
                record_repo::upsert(
                    &pool,
                    key,
                    value,
                    ttl_seconds,
                    record::expire_at(now, ttl_seconds),
                    now,
                )
                .await
                .map_err(ConnectionError::from)
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.ready().await?;
        let deleted = self
            .manager
            .execute(|pool| async move {
                record_repo::delete(&pool, key)
                    .await
                    .map_err(ConnectionError::from)
            })
            .await?;
        Ok(deleted)
    }

    async fn truncate(&self) -> StoreResult<u64> {
        self.ready().await?;
        let removed = self
            .manager
            .execute(|pool| async move {
                record_repo::delete_all(&pool)
                    .await
                    .map_err(ConnectionError::from)
            })
            .await?;
        Ok(removed)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        self.ready().await?;
        let removed = self
            .manager
            .execute(|pool| async move {
                record_repo::delete_expired(&pool, Utc::now())
                    .await
                    .map_err(ConnectionError::from)
            })
            .await?;
        Ok(removed)
    }
}

pub struct SqliteDocumentStore {
    manager: ConnectionManager<SqliteConnector>,
}

impl SqliteDocumentStore {
    pub fn new(manager: ConnectionManager<SqliteConnector>) -> Self {
        Self { manager }
    }

    async fn ready(&self) -> StoreResult<()> {
        if self.manager.ensure_connection().await {
            Ok(())
        } else {
            Err(StoreError::Unavailable("sqlite is not reachable".into()))
        }
    }
}

#[async_trait]
impl RecordStore for SqliteDocumentStore {
    fn backend_name(&self) -> &'static str {
        self.manager.backend_name()
    }

    async fn is_available(&self) -> bool {
        self.manager.is_connected().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<PersistentRecord>> {
        self.ready().await?;
        let row = self
            .manager
            .execute(|pool| async move {
                document_repo::find_active(&pool, key, Utc::now())
                    .await
                    .map_err(ConnectionError::from)
            })
            .await?;
        Ok(row.map(PersistentRecord::from))
    }

    async fn upsert(&self, key: &str, value: &Value, ttl: Option<Duration>) -> StoreResult<()> {
        self.ready().await?;
        self.manager
            .execute(|pool| async move {
                let now = Utc::now();
                let ttl_seconds = record::ttl_seconds(ttl);
                document_repo::upsert(
                    &pool,
                    key,
                    value,
                    ttl_seconds,
                    record::expire_at(now, ttl_seconds),
                    now,
                )
                .await
                .map_err(ConnectionError::from)
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.ready().await?;
        let deleted = self
            .manager
            .execute(|pool| async move {
                document_repo::delete(&pool, key)
                    .await
                    .map_err(ConnectionError::from)
            })
            .await?;
        Ok(deleted)
    }

    async fn truncate(&self) -> StoreResult<u64> {
        self.ready().await?;
        let removed = self
            .manager
            .execute(|pool| async move {
                document_repo::delete_all(&pool)
                    .await
                    .map_err(ConnectionError::from)
            })
            .await?;
        Ok(removed)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        self.ready().await?;
        let removed = self
            .manager
            .execute(|pool| async move {
                document_repo::delete_expired(&pool, Utc::now())
                    .await
                    .map_err(ConnectionError::from)
            })
            .await?;
        Ok(removed)
    }
}
