use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row/document in a persistent store, keyed uniquely by `key`.
///
/// `expire_at = updated_at + ttl_seconds` whenever a positive TTL was given;
/// records without one live until overwritten or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentRecord {
    pub key: String,
    pub value: Value,
    pub ttl_seconds: Option<u64>,
    pub expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistentRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

/// TTL in whole seconds, `None` for absent or zero TTLs.
///
/// Non-zero TTLs are at least one second, the same floor the Valkey cache applies.
pub fn ttl_seconds(ttl: Option<Duration>) -> Option<i64> {
    ttl.filter(|t| !t.is_zero())
        .map(|t| t.as_secs().max(1))
        .map(|s| i64::try_from(s).unwrap_or(i64::MAX))
}

pub fn expire_at(now: DateTime<Utc>, ttl_seconds: Option<i64>) -> Option<DateTime<Utc>> {
    ttl_seconds.and_then(|s| now.checked_add_signed(chrono::Duration::try_seconds(s)?))
}
