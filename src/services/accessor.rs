//! Per-platform user data access on top of the storage layer.
//!
//! A stored entry is wrapped with the time it was fetched; entries older than the
//! caller's `max_age` are refreshed from upstream, and the stale copy is served
//! when upstream stays unavailable after retries.
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::services::cache::KeyScheme;
use crate::services::retry::{Backoff, Retryable, retry, retry_or_else};
use crate::services::storage::{PersistQueue, StorageError, StorageService, StorageStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Github,
    Leetcode,
    Juejin,
    Bilibili,
}

impl Platform {
    /// Key namespace, and therefore cache group, for this platform.
    pub fn namespace(self) -> &'static str {
        match self {
            Platform::Github => "github",
            Platform::Leetcode => "leetcode",
            Platform::Juejin => "juejin",
            Platform::Bilibili => "bilibili",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Platform::Github),
            "leetcode" => Ok(Platform::Leetcode),
            "juejin" => Ok(Platform::Juejin),
            "bilibili" => Ok(Platform::Bilibili),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUserData<T> {
    pub data: T,
    pub fetched_at: DateTime<Utc>,
}

impl<T> StoredUserData<T> {
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(self.fetched_at) > max_age,
            // Larger than chrono can represent: never stale.
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("upstream fetch failed: {message}")]
pub struct UpstreamError {
    pub message: String,
    pub retryable: bool,
}

impl UpstreamError {
    /// Timeouts, 5xx, rate limits.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Unknown user, malformed response.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

#[derive(Debug, Error)]
pub enum AccessorError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

enum Fetched<T> {
    Fresh(T),
    Stale(StoredUserData<T>),
}

pub fn storage_key(platform: Platform, uid: &str, variant: Option<&str>) -> String {
    let key = KeyScheme::new(platform.namespace(), uid);
    match variant {
        Some(variant) => key.with_variant(variant).to_string(),
        None => key.to_string(),
    }
}

pub struct UserDataAccessor {
    storage: Arc<StorageService>,
    persist: Arc<PersistQueue>,
    fetch_backoff: Backoff,
}

impl UserDataAccessor {
    pub fn new(storage: Arc<StorageService>, persist: Arc<PersistQueue>, fetch_backoff: Backoff) -> Self {
        Self {
            storage,
            persist,
            fetch_backoff,
        }
    }

    /// Return stored data younger than `max_age`, otherwise refresh it with `fetch`.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        platform: Platform,
        uid: &str,
        variant: Option<&str>,
        max_age: Duration,
        mut fetch: F,
    ) -> Result<T, AccessorError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let key = storage_key(platform, uid, variant);
        let stored: Option<StoredUserData<T>> = self.storage.get(&key).await?;

        let data = match stored {
            Some(stored) if !stored.is_stale(max_age, Utc::now()) => {
                debug!(key = %key, "serving stored data");
                return Ok(stored.data);
            }
            Some(stale) => {
                let fetched = retry_or_else(
                    &self.fetch_backoff,
                    "upstream_fetch",
                    || {
                        let pending = fetch();
                        async move { pending.await.map(Fetched::Fresh) }
                    },
                    move || Fetched::Stale(stale),
                )
                .await?;

                match fetched {
                    Fetched::Fresh(data) => data,
                    Fetched::Stale(stale) => {
                        warn!(
                            key = %key,
                            fetched_at = %stale.fetched_at,
                            "upstream unavailable, serving stale data"
                        );
                        return Ok(stale.data);
                    }
                }
            }
            None => retry(&self.fetch_backoff, "upstream_fetch", &mut fetch).await?,
        };

        self.store(key, data).await
    }

    async fn store<T: Serialize>(&self, key: String, data: T) -> Result<T, AccessorError> {
        let stored = StoredUserData {
            data,
            fetched_at: Utc::now(),
        };
        let value =
            serde_json::to_value(&stored).map_err(|e| StorageError::Serialization(e.to_string()))?;

        match self.storage.strategy() {
            StorageStrategy::PersistentOnly => {
                if !self.storage.set(&key, &value, None).await? {
                    warn!(key = %key, "fresh data could not be stored");
                }
            }
            strategy => {
                match self.storage.cache().set(&key, &value, None).await {
                    Ok(true) => {}
                    Ok(false) => warn!(key = %key, "fresh data not cached"),
                    Err(e) => warn!(key = %key, error = %e, "fresh data not cached"),
                }
                if strategy == StorageStrategy::Hybrid {
                    self.persist.submit(key.clone(), value, None);
                }
            }
        }

        info!(key = %key, "upstream data refreshed");
        Ok(stored.data)
    }
}
