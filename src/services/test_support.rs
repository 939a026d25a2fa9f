//! Switchable backends for exercising outage paths in unit tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::services::cache::CacheService;
use crate::services::cache::client::{CacheClient, CacheError, CacheResult};
use crate::services::cache::memory::MemoryClient;
use crate::services::storage::record::{self, PersistentRecord};
use crate::services::storage::store::{RecordStore, StoreError, StoreResult};
use crate::services::storage::{PersistOptions, PersistQueue, StorageOptions, StorageService};
use crate::state::AppState;

/// App state over a memory cache, optionally backed by a primary store.
pub fn app_state(primary: Option<&ToggleStore>) -> AppState {
    let primary = primary.map(|p| Arc::new(p.clone()) as Arc<dyn RecordStore>);
    let storage = Arc::new(StorageService::new(
        Arc::new(CacheService::memory(Duration::from_secs(60))),
        primary,
        None,
        StorageOptions::default(),
    ));
    let persist = Arc::new(PersistQueue::new(
        Arc::clone(&storage),
        PersistOptions::default(),
    ));
    AppState::new(storage, persist, Vec::new(), Duration::from_secs(60))
}

pub fn memory_state() -> AppState {
    app_state(None)
}

/// Memory cache that can be switched off.
#[derive(Clone, Default)]
pub struct ToggleCache {
    inner: MemoryClient,
    down: Arc<AtomicBool>,
}

impl ToggleCache {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> CacheResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::BackendConnection("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheClient for ToggleCache {
    fn backend_name(&self) -> &'static str {
        "toggle"
    }

    async fn is_available(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        self.inner.get_string(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.check()?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> CacheResult<u64> {
        self.check()?;
        self.inner.del(key).await
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        self.check()?;
        self.inner.keys().await
    }

    async fn flush(&self) -> CacheResult<()> {
        self.check()?;
        self.inner.flush().await
    }
}

/// HashMap-backed record store that can be switched off or made to reject writes.
#[derive(Clone)]
pub struct ToggleStore {
    name: &'static str,
    records: Arc<Mutex<HashMap<String, PersistentRecord>>>,
    down: Arc<AtomicBool>,
    reject: Arc<AtomicBool>,
    pub upserts: Arc<AtomicU32>,
    pub purges: Arc<AtomicU32>,
}

impl ToggleStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: Arc::default(),
            down: Arc::default(),
            reject: Arc::default(),
            upserts: Arc::default(),
            purges: Arc::default(),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{} is down", self.name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for ToggleStore {
    fn backend_name(&self) -> &'static str {
        self.name
    }

    async fn is_available(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<PersistentRecord>> {
        self.check()?;
        let now = Utc::now();
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(key)
            .filter(|r| !r.is_expired_at(now))
            .cloned())
    }

    async fn upsert(&self, key: &str, value: &Value, ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        if self.reject.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("simulated constraint violation".into()));
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);

        let now = Utc::now();
        let ttl_seconds = record::ttl_seconds(ttl);
        let mut records = self.records.lock().unwrap();
        let created_at = records.get(key).map_or(now, |r| r.created_at);
        records.insert(
            key.to_string(),
            PersistentRecord {
                key: key.to_string(),
                value: value.clone(),
                ttl_seconds: ttl_seconds.map(|s| s as u64),
                expire_at: record::expire_at(now, ttl_seconds),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.records.lock().unwrap().remove(key).is_some())
    }

    async fn truncate(&self) -> StoreResult<u64> {
        self.check()?;
        let mut records = self.records.lock().unwrap();
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        self.check()?;
        self.purges.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| !r.is_expired_at(now));
        Ok((before - records.len()) as u64)
    }
}
