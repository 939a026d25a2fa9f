//! Cache service: the narrow get/set/delete/clear surface used by the rest of the app.
//!
//! Hit/miss counters and the key-group index live here, outside the backend, so
//! observability and bulk invalidation behave the same for every backend.
//! Backend failures never escape: reads become misses, writes return `false`.
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::services::cache::client::{CacheClient, CacheError, CacheResult};
use crate::services::cache::groups::KeyGroupIndex;
use crate::services::cache::keys::KeyPattern;
use crate::services::cache::memory::MemoryClient;
use crate::services::cache::noop::NoopClient;

/// Lifetime counters, reset only by a process restart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub key_count: usize,
    pub group_count: usize,
    pub hit_rate: f64,
}

pub struct CacheService {
    client: Arc<dyn CacheClient>,
    groups: KeyGroupIndex,
    hits: AtomicU64,
    misses: AtomicU64,
    default_ttl: Duration,
}

impl CacheService {
    pub fn new(client: Arc<dyn CacheClient>, default_ttl: Duration) -> Self {
        Self {
            client,
            groups: KeyGroupIndex::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            default_ttl,
        }
    }

    pub fn memory(default_ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryClient::new()), default_ttl)
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopClient), Duration::from_secs(1))
    }

    /// Bound the key-group index to `max_keys` members.
    pub fn with_index_limit(mut self, max_keys: usize) -> Self {
        self.groups = KeyGroupIndex::with_limit(max_keys);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.client.backend_name()
    }

    pub async fn is_available(&self) -> bool {
        self.client.is_available().await
    }

    // None or zero means "use the default", never "keep forever".
    fn resolve_ttl(&self, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.default_ttl,
        }
    }

    /// Read and decode a value. Undecodable values and backend errors count as misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.client.get_string(key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(backend = self.backend_name(), key, error = %e, "cache read failed, treating as miss");
                None
            }
        };

        let value = raw.and_then(|raw| match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "cached value does not decode, treating as miss");
                None
            }
        });

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, outcome = "hit", "cache get");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, outcome = "miss", "cache get");
        }
        value
    }

    /// Serialize and write a value.
    ///
    /// Returns `Ok(false)` when the backend could not confirm the write; `Err` only
    /// when the value itself cannot be serialized.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let raw = serde_json::to_string(value).map_err(|e| CacheError::InvalidValue(e.to_string()))?;
        let ttl = self.resolve_ttl(ttl);

        match self.client.set_with_ttl(key, &raw, ttl).await {
            Ok(()) => {
                if !self.groups.add(key) {
                    self.prune_index().await;
                    if !self.groups.add(key) {
                        warn!(key, "key group index full, key not indexed");
                    }
                }
                debug!(key, ttl_secs = ttl.as_secs(), "cache set");
                Ok(true)
            }
            Err(e) => {
                warn!(backend = self.backend_name(), key, error = %e, "cache write failed");
                Ok(false)
            }
        }
    }

    /// Returns whether a live key was removed.
    pub async fn delete(&self, key: &str) -> bool {
        self.groups.remove(key);
        match self.client.del(key).await {
            Ok(n) => n > 0,
            Err(e) => {
                warn!(backend = self.backend_name(), key, error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Drop every key in the backend.
    pub async fn clear(&self) -> bool {
        match self.client.flush().await {
            Ok(()) => {
                self.groups.clear();
                info!(backend = self.backend_name(), "cache cleared");
                true
            }
            Err(e) => {
                warn!(backend = self.backend_name(), error = %e, "cache clear failed");
                false
            }
        }
    }

    /// Delete every live key matching `pattern`. Returns how many were removed.
    pub async fn delete_by_pattern(&self, pattern: &KeyPattern) -> u64 {
        let keys = match self.client.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(backend = self.backend_name(), error = %e, "cache key listing failed");
                return 0;
            }
        };

        let matching: Vec<String> = keys.into_iter().filter(|k| pattern.matches(k)).collect();
        for key in &matching {
            self.groups.remove(key);
        }

        let deleted = match self.client.del_many(&matching).await {
            Ok(n) => n,
            Err(e) => {
                warn!(backend = self.backend_name(), error = %e, "cache delete failed");
                0
            }
        };

        info!(backend = self.backend_name(), deleted, "cache keys deleted by pattern");
        deleted
    }

    /// Delete every key currently indexed under `group`.
    pub async fn clear_group(&self, group: &str) -> u64 {
        let members = self.groups.take_group(group);

        let deleted = match self.client.del_many(&members).await {
            Ok(n) => n,
            Err(e) => {
                warn!(group, error = %e, "cache delete failed, keeping keys indexed");
                for key in &members {
                    self.groups.add(key);
                }
                0
            }
        };

        info!(backend = self.backend_name(), group, deleted, "cache group cleared");
        deleted
    }

    /// Evict expired entries and drop their keys from the group index.
    pub async fn purge_expired(&self) -> u64 {
        let purged = match self.client.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                warn!(backend = self.backend_name(), error = %e, "cache purge failed");
                0
            }
        };
        self.prune_index().await;
        purged
    }

    // Keys gone from the backend (expired, evicted) leave the index here.
    async fn prune_index(&self) -> usize {
        let live: HashSet<String> = match self.client.keys().await {
            Ok(keys) => keys.into_iter().collect(),
            Err(e) => {
                warn!(backend = self.backend_name(), error = %e, "cache key listing failed, index not pruned");
                return 0;
            }
        };

        let dropped = self.groups.retain_live(&live);
        if dropped > 0 {
            debug!(backend = self.backend_name(), dropped, "stale keys dropped from group index");
        }
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            backend: self.backend_name(),
            hits,
            misses,
            key_count: self.groups.key_count(),
            group_count: self.groups.group_count(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::ToggleCache;
    use serde_json::{Value, json};

    fn service() -> CacheService {
        CacheService::memory(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = service();
        let value = json!({"count": 42, "langs": ["rust", "go"]});

        assert!(cache.set("github:octocat:dark", &value, None).await.unwrap());
        assert_eq!(cache.get::<Value>("github:octocat:dark").await, Some(value));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_disappear_after_ttl() {
        let cache = service();
        let ttl = Some(Duration::from_secs(120));
        cache
            .set("github:octocat:dark", &json!({"count": 42}), ttl)
            .await
            .unwrap();

        assert_eq!(
            cache.get::<Value>("github:octocat:dark").await,
            Some(json!({"count": 42}))
        );

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(cache.get::<Value>("github:octocat:dark").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_uses_default() {
        let cache = service();
        cache.set("a:1", &1, Some(Duration::ZERO)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(cache.get::<i32>("a:1").await, Some(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.get::<i32>("a:1").await, None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let cache = service();
        assert!(!cache.delete("missing").await);

        cache.set("a:1", &"x", None).await.unwrap();
        assert!(cache.delete("a:1").await);
        assert!(!cache.delete("a:1").await);
    }

    #[tokio::test]
    async fn clear_group_only_touches_that_group() {
        let cache = service();
        cache.set("a:1", &"x", None).await.unwrap();
        cache.set("a:2", &"y", None).await.unwrap();
        cache.set("b:1", &"z", None).await.unwrap();

        assert_eq!(cache.clear_group("a").await, 2);
        assert_eq!(cache.get::<String>("a:1").await, None);
        assert_eq!(cache.get::<String>("a:2").await, None);
        assert_eq!(cache.get::<String>("b:1").await.as_deref(), Some("z"));

        assert_eq!(cache.clear_group("a").await, 0);
        assert_eq!(cache.clear_group("nothing").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_group_tolerates_expired_members() {
        let cache = service();
        cache
            .set("a:1", &"x", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        cache.set("a:2", &"y", None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.clear_group("a").await, 1);
        assert_eq!(cache.stats().group_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweep_drops_dead_keys_from_stats() {
        let cache = service();
        for i in 0..1000 {
            cache
                .set(&format!("http:GET:/records/a?n={i}"), &i, Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        assert_eq!(cache.stats().key_count, 1000);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired().await, 1000);

        let stats = cache.stats();
        assert_eq!(stats.key_count, 0);
        assert_eq!(stats.group_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_index_makes_room_by_pruning_expired_keys() {
        let cache = service().with_index_limit(2);
        let short = Some(Duration::from_secs(1));
        cache.set("a:1", &1, short).await.unwrap();
        cache.set("a:2", &2, short).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.set("a:3", &3, None).await.unwrap());

        assert_eq!(cache.stats().key_count, 1);
        assert_eq!(cache.clear_group("a").await, 1);
        assert_eq!(cache.get::<i32>("a:3").await, None);
    }

    #[tokio::test]
    async fn bulk_deletes_use_one_multi_key_call() {
        let client = CountingCache::default();
        let cache = CacheService::new(Arc::new(client.clone()), Duration::from_secs(60));
        for key in ["a:1", "a:2", "b:1", "b:2"] {
            cache.set(key, &1, None).await.unwrap();
        }

        assert_eq!(cache.delete_by_pattern(&KeyPattern::substring("b:")).await, 2);
        assert_eq!(cache.clear_group("a").await, 2);

        assert_eq!(client.del_many_calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.del_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_by_pattern_supports_substring_and_regex() {
        let cache = service();
        cache.set("github:octocat:dark", &1, None).await.unwrap();
        cache.set("github:octocat:light", &2, None).await.unwrap();
        cache.set("leetcode:octocat", &3, None).await.unwrap();

        let dark = KeyPattern::regex(r":dark$").unwrap();
        assert_eq!(cache.delete_by_pattern(&dark).await, 1);
        assert_eq!(cache.delete_by_pattern(&KeyPattern::substring("octocat")).await, 2);
        assert_eq!(cache.delete_by_pattern(&KeyPattern::substring("octocat")).await, 0);
        assert_eq!(cache.stats().key_count, 0);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let cache = service();
        cache.set("a:1", &1, None).await.unwrap();
        cache.set("b:1", &2, None).await.unwrap();

        assert!(cache.clear().await);
        assert!(cache.clear().await);
        assert_eq!(cache.get::<i32>("a:1").await, None);
        assert_eq!(cache.stats().key_count, 0);
    }

    #[tokio::test]
    async fn every_get_is_counted_once() {
        let cache = service();
        cache.set("a:1", &1, None).await.unwrap();

        for i in 0..10 {
            let key = if i % 3 == 0 { "a:1" } else { "a:missing" };
            let _ = cache.get::<i32>(key).await;
        }

        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 10);
        assert_eq!(stats.hits, 4);
        assert!((stats.hit_rate - 0.4).abs() < f64::EPSILON);
        assert_eq!(stats.group_count, 1);
    }

    #[tokio::test]
    async fn undecodable_value_is_a_miss() {
        let cache = service();
        cache.set("a:1", &"not a number", None).await.unwrap();

        assert_eq!(cache.get::<i32>("a:1").await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn backend_outage_degrades_instead_of_failing() {
        let client = ToggleCache::default();
        let cache = CacheService::new(Arc::new(client.clone()), Duration::from_secs(60));
        cache.set("a:1", &1, None).await.unwrap();

        client.set_down(true);
        assert_eq!(cache.get::<i32>("a:1").await, None);
        assert!(!cache.set("a:2", &2, None).await.unwrap());
        assert!(!cache.delete("a:1").await);
        assert!(!cache.clear().await);
        assert_eq!(cache.delete_by_pattern(&KeyPattern::substring("a")).await, 0);
        assert!(!cache.is_available().await);

        client.set_down(false);
        assert_eq!(cache.get::<i32>("a:1").await, Some(1));
    }

    #[tokio::test]
    async fn noop_backend_always_misses_and_accepts_writes() {
        let cache = CacheService::noop();
        assert!(cache.set("a:1", &1, None).await.unwrap());
        assert_eq!(cache.get::<i32>("a:1").await, None);
        assert!(!cache.delete("a:1").await);
        assert!(cache.clear().await);
        assert_eq!(cache.clear_group("a").await, 0);
        assert_eq!(cache.stats().misses, 1);
    }

    /// Memory client that counts single and multi-key deletes.
    #[derive(Clone, Default)]
    struct CountingCache {
        inner: MemoryClient,
        del_calls: Arc<AtomicU64>,
        del_many_calls: Arc<AtomicU64>,
    }

    #[async_trait::async_trait]
    impl CacheClient for CountingCache {
        fn backend_name(&self) -> &'static str {
            "counting"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
            self.inner.get_string(key).await
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn del(&self, key: &str) -> CacheResult<u64> {
            self.del_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.del(key).await
        }

        async fn del_many(&self, keys: &[String]) -> CacheResult<u64> {
            self.del_many_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.del_many(keys).await
        }

        async fn keys(&self) -> CacheResult<Vec<String>> {
            self.inner.keys().await
        }

        async fn flush(&self) -> CacheResult<()> {
            self.inner.flush().await
        }
    }

    #[tokio::test]
    async fn unserializable_value_is_a_caller_error() {
        use std::collections::HashMap;

        let cache = service();
        // JSON object keys must be strings.
        let mut bad: HashMap<Vec<u8>, i32> = HashMap::new();
        bad.insert(vec![1, 2], 3);

        assert!(matches!(
            cache.set("a:1", &bad, None).await,
            Err(CacheError::InvalidValue(_))
        ));
    }
}
