use serde::Serialize;

use crate::services::cache::CacheStats;
use crate::services::connection::ConnectionStatus;
use crate::services::storage::{PersistStats, StorageStatus};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    // "ok" | "degraded" | "unavailable"
    pub status: &'static str,
    pub cache: CacheStats,
    pub storage: StorageStatus,
    pub persist: PersistStats,
    pub connections: Vec<ConnectionStatus>,
}
