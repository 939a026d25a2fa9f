//! Cache client interface implemented by every cache backend (memory, valkey, noop).
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::services::connection::ConnectionError;
use crate::services::retry::Retryable;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-layer errors (transport/command/serialization).
///
/// Note:
/// - Backend errors never leave `CacheService`; they become misses or `false`.
/// - `InvalidValue` / `InvalidPattern` are caller bugs and are surfaced as-is.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    BackendConnection(String),
    #[error("cache command error: {0}")]
    BackendCommand(String),
    #[error("cache value error: {0}")]
    InvalidValue(String),
    #[error("invalid key pattern: {0}")]
    InvalidPattern(String),
}

impl Retryable for CacheError {
    fn is_retryable(&self) -> bool {
        matches!(self, CacheError::BackendConnection(_))
    }
}

impl From<ConnectionError> for CacheError {
    fn from(e: ConnectionError) -> Self {
        if e.is_retryable() {
            CacheError::BackendConnection(e.to_string())
        } else {
            CacheError::BackendCommand(e.to_string())
        }
    }
}

/// A minimal, string-based cache interface.
///
/// Values are already serialized by `CacheService`; backends only move strings
/// around and enforce TTLs natively.
#[async_trait]
pub trait CacheClient: Send + Sync + 'static {
    // Returns the cache backend name (for logging/metrics).
    fn backend_name(&self) -> &'static str;

    // Reachability from local state only (no I/O).
    async fn is_available(&self) -> bool;

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>>;

    // Overwrite `key`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    // Delete a key. Returns number of deleted keys.
    async fn del(&self, key: &str) -> CacheResult<u64>;

    // Delete several keys. Backends with a multi-key delete override this.
    async fn del_many(&self, keys: &[String]) -> CacheResult<u64> {
        let mut removed = 0;
        for key in keys {
            removed += self.del(key).await?;
        }
        Ok(removed)
    }

    // Every live key in the backend.
    async fn keys(&self) -> CacheResult<Vec<String>>;

    // Drop every key in the backend.
    async fn flush(&self) -> CacheResult<()>;

    // Evict expired entries for backends that do not expire on their own.
    async fn purge_expired(&self) -> CacheResult<u64> {
        Ok(0)
    }
}
