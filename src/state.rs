/*
 * Responsibility
 * - Router に紐づける共有コンテキスト (AppState)
 *   - cache / storage / persist queue / connection manager の状態参照
 * - Clone 前提で持つ (内部は Arc)
 */
use std::sync::Arc;
use std::time::Duration;

use crate::services::cache::CacheService;
use crate::services::connection::ManagedConnection;
use crate::services::storage::{PersistQueue, StorageService};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheService>,
    pub storage: Arc<StorageService>,
    pub persist: Arc<PersistQueue>,
    pub connections: Arc<Vec<Arc<dyn ManagedConnection>>>,
    pub http_cache_ttl: Duration,
}

impl AppState {
    pub fn new(
        storage: Arc<StorageService>,
        persist: Arc<PersistQueue>,
        connections: Vec<Arc<dyn ManagedConnection>>,
        http_cache_ttl: Duration,
    ) -> Self {
        Self {
            cache: Arc::clone(storage.cache()),
            storage,
            persist,
            connections: Arc::new(connections),
            http_cache_ttl,
        }
    }
}
