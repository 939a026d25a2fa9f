//! Storage facade: the cache tier composed with up to two persistent stores.
//!
//! Read order (hybrid): cache, then primary; the backup is consulted only when
//! the primary *errors*, never on a plain miss. Values found in a persistent
//! store are not copied back into the cache here; callers populate it via `set`.
//!
//! Write order (hybrid): cache and persistent tier concurrently; the persistent
//! tier writes the primary and falls back to the backup when the primary is
//! unreachable. A write that only reached the cache is reported as success
//! (logged as durability-degraded) unless durable writes are required.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::services::cache::CacheService;
use crate::services::storage::record::PersistentRecord;
use crate::services::storage::store::{RecordStore, StoreError};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("value is not serializable: {0}")]
    Serialization(String),
    #[error("store rejected the write: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategy {
    CacheOnly,
    PersistentOnly,
    #[default]
    Hybrid,
}

impl FromStr for StorageStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cache_only" | "cache" => Ok(Self::CacheOnly),
            "persistent_only" | "persistent" => Ok(Self::PersistentOnly),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown storage strategy: {other}")),
        }
    }
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CacheOnly => "cache_only",
            Self::PersistentOnly => "persistent_only",
            Self::Hybrid => "hybrid",
        })
    }
}

/// Which degraded path, if any, reads and writes currently take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    None,
    BackupStore,
    CacheOnly,
    PersistentOnly,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub backend: &'static str,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub strategy: StorageStrategy,
    pub cache: BackendStatus,
    pub primary: Option<BackendStatus>,
    pub backup: Option<BackendStatus>,
    pub persistent_available: bool,
    pub fallback_mode: FallbackMode,
    pub require_durable_writes: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StorageOptions {
    pub strategy: StorageStrategy,
    // Reject hybrid writes that only reached the cache.
    pub require_durable_writes: bool,
}

pub struct StorageService {
    cache: Arc<CacheService>,
    primary: Option<Arc<dyn RecordStore>>,
    backup: Option<Arc<dyn RecordStore>>,
    requested: StorageStrategy,
    strategy: StorageStrategy,
    require_durable_writes: bool,
}

impl StorageService {
    pub fn new(
        cache: Arc<CacheService>,
        primary: Option<Arc<dyn RecordStore>>,
        backup: Option<Arc<dyn RecordStore>>,
        options: StorageOptions,
    ) -> Self {
        let requested = options.strategy;
        let strategy = if primary.is_none() && backup.is_none() && requested != StorageStrategy::CacheOnly {
            warn!(
                requested = %requested,
                "no persistent store configured, degrading to cache_only"
            );
            StorageStrategy::CacheOnly
        } else {
            requested
        };

        info!(
            strategy = %strategy,
            cache = cache.backend_name(),
            primary = primary.as_ref().map(|s| s.backend_name()),
            backup = backup.as_ref().map(|s| s.backend_name()),
            require_durable_writes = options.require_durable_writes,
            "storage service ready"
        );

        Self {
            cache,
            primary,
            backup,
            requested,
            strategy,
            require_durable_writes: options.require_durable_writes,
        }
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        validate_key(key)?;
        let found = match self.strategy {
            StorageStrategy::CacheOnly => self.cache.get(key).await,
            StorageStrategy::PersistentOnly => self.get_persistent(key).await,
            StorageStrategy::Hybrid => match self.cache.get(key).await {
                Some(value) => Some(value),
                None => self.get_persistent(key).await,
            },
        };
        Ok(found)
    }

    /// Returns whether at least one tier accepted the write (see module docs).
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        validate_key(key)?;
        let value = serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))?;

        match self.strategy {
            StorageStrategy::CacheOnly => Ok(self.write_cache(key, &value, ttl).await),
            StorageStrategy::PersistentOnly => self.write_record(key, &value, ttl).await,
            StorageStrategy::Hybrid => {
                let (cached, durable) = tokio::join!(
                    self.write_cache(key, &value, ttl),
                    self.write_record(key, &value, ttl)
                );
                let durable = match durable {
                    Ok(durable) => durable,
                    Err(e) => {
                        self.drop_rejected(key).await;
                        return Err(e);
                    }
                };

                if durable {
                    Ok(true)
                } else if !cached {
                    error!(key, "write failed on every tier");
                    Ok(false)
                } else if self.require_durable_writes {
                    warn!(key, "write reached only the cache, rejecting (durable writes required)");
                    Ok(false)
                } else {
                    warn!(key, "durability degraded: write reached only the cache");
                    Ok(true)
                }
            }
        }
    }

    /// Persistent tiers only. Used by the background persist queue after the
    /// cache has already been populated inline.
    pub async fn persist(&self, key: &str, value: &Value, ttl: Option<Duration>) -> StorageResult<bool> {
        validate_key(key)?;
        match self.strategy {
            StorageStrategy::CacheOnly => Ok(true),
            StorageStrategy::PersistentOnly => self.write_record(key, value, ttl).await,
            StorageStrategy::Hybrid => {
                let result = self.write_record(key, value, ttl).await;
                if result.is_err() {
                    self.drop_rejected(key).await;
                }
                result
            }
        }
    }

    // A value a store refused must not stay readable from the cache.
    async fn drop_rejected(&self, key: &str) {
        self.cache.delete(key).await;
        warn!(key, "store rejected the write, cache entry dropped");
    }

    /// Returns whether any tier removed the key.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let deleted = match self.strategy {
            StorageStrategy::CacheOnly => self.cache.delete(key).await,
            StorageStrategy::PersistentOnly => self.delete_record(key).await,
            StorageStrategy::Hybrid => {
                let (cached, stored) = tokio::join!(self.cache.delete(key), self.delete_record(key));
                cached || stored
            }
        };
        Ok(deleted)
    }

    pub async fn clear(&self) -> bool {
        match self.strategy {
            StorageStrategy::CacheOnly => self.cache.clear().await,
            StorageStrategy::PersistentOnly => self.truncate_stores().await,
            StorageStrategy::Hybrid => {
                let (cached, stored) = tokio::join!(self.cache.clear(), self.truncate_stores());
                cached || stored
            }
        }
    }

    /// Sweep expired entries from every tier. Returns how many were removed.
    pub async fn purge_expired(&self) -> u64 {
        let mut removed = self.cache.purge_expired().await;
        for store in self.stores() {
            match store.purge_expired().await {
                Ok(n) => removed += n,
                Err(e) => warn!(backend = store.backend_name(), error = %e, "expiry sweep failed"),
            }
        }
        removed
    }

    /// Read-only snapshot of tier reachability. Never fails.
    pub async fn storage_status(&self) -> StorageStatus {
        let cache = BackendStatus {
            backend: self.cache.backend_name(),
            available: self.cache.is_available().await,
        };
        let primary = backend_status(self.primary.as_ref()).await;
        let backup = backend_status(self.backup.as_ref()).await;

        let primary_up = primary.as_ref().is_some_and(|s| s.available);
        let backup_up = backup.as_ref().is_some_and(|s| s.available);

        StorageStatus {
            strategy: self.strategy,
            fallback_mode: self.fallback_mode(cache.available, primary_up, backup_up),
            persistent_available: primary_up || backup_up,
            require_durable_writes: self.require_durable_writes,
            cache,
            primary,
            backup,
        }
    }

    fn fallback_mode(&self, cache_up: bool, primary_up: bool, backup_up: bool) -> FallbackMode {
        match self.strategy {
            StorageStrategy::CacheOnly if !cache_up => FallbackMode::Unavailable,
            StorageStrategy::CacheOnly if self.requested != StorageStrategy::CacheOnly => {
                FallbackMode::CacheOnly
            }
            StorageStrategy::CacheOnly => FallbackMode::None,
            StorageStrategy::PersistentOnly if primary_up => FallbackMode::None,
            StorageStrategy::PersistentOnly if backup_up => FallbackMode::BackupStore,
            StorageStrategy::PersistentOnly => FallbackMode::Unavailable,
            StorageStrategy::Hybrid => match (cache_up, primary_up, backup_up) {
                (true, true, _) => FallbackMode::None,
                (_, false, true) => FallbackMode::BackupStore,
                (true, false, false) => FallbackMode::CacheOnly,
                (false, true, _) => FallbackMode::PersistentOnly,
                (false, false, false) => FallbackMode::Unavailable,
            },
        }
    }

    fn stores(&self) -> impl Iterator<Item = &Arc<dyn RecordStore>> {
        self.primary.iter().chain(self.backup.iter())
    }

    async fn write_cache(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        // A serde_json::Value always re-serializes.
        self.cache.set(key, value, ttl).await.unwrap_or(false)
    }

    async fn get_persistent<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let record = self.read_record(key).await?;
        match serde_json::from_value(record.value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "stored value does not decode, treating as not found");
                None
            }
        }
    }

    async fn read_record(&self, key: &str) -> Option<PersistentRecord> {
        if let Some(primary) = &self.primary {
            match primary.get(key).await {
                Ok(found) => return found,
                Err(e) => warn!(
                    backend = primary.backend_name(),
                    key,
                    error = %e,
                    "primary store read failed, trying backup"
                ),
            }
        }

        let backup = self.backup.as_ref()?;
        match backup.get(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(backend = backup.backend_name(), key, error = %e, "backup store read failed");
                None
            }
        }
    }

    async fn write_record(&self, key: &str, value: &Value, ttl: Option<Duration>) -> StorageResult<bool> {
        if let Some(primary) = &self.primary {
            match primary.upsert(key, value, ttl).await {
                Ok(()) => return Ok(true),
                Err(StoreError::Rejected(message)) => return Err(StorageError::Rejected(message)),
                Err(e) => warn!(
                    backend = primary.backend_name(),
                    key,
                    error = %e,
                    "primary store write failed, trying backup"
                ),
            }
        }

        let Some(backup) = &self.backup else {
            return Ok(false);
        };
        match backup.upsert(key, value, ttl).await {
            Ok(()) => Ok(true),
            Err(StoreError::Rejected(message)) => Err(StorageError::Rejected(message)),
            Err(e) => {
                warn!(backend = backup.backend_name(), key, error = %e, "backup store write failed");
                Ok(false)
            }
        }
    }

    // Both stores: the backup may hold a copy written while the primary was down.
    async fn delete_record(&self, key: &str) -> bool {
        let mut deleted = false;
        for store in self.stores() {
            match store.delete(key).await {
                Ok(removed) => deleted |= removed,
                Err(e) => warn!(backend = store.backend_name(), key, error = %e, "store delete failed"),
            }
        }
        deleted
    }

    async fn truncate_stores(&self) -> bool {
        let mut cleared = false;
        for store in self.stores() {
            match store.truncate().await {
                Ok(removed) => {
                    info!(backend = store.backend_name(), removed, "store truncated");
                    cleared = true;
                }
                Err(e) => warn!(backend = store.backend_name(), error = %e, "store truncate failed"),
            }
        }
        cleared
    }
}

async fn backend_status(store: Option<&Arc<dyn RecordStore>>) -> Option<BackendStatus> {
    let store = store?;
    Some(BackendStatus {
        backend: store.backend_name(),
        available: store.is_available().await,
    })
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.trim().is_empty() {
        return Err(StorageError::InvalidKey("key must not be empty".into()));
    }
    Ok(())
}
