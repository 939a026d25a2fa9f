//! Background persistence with bounded concurrency.
//!
//! Accessors return fresh data to the caller as soon as the cache holds it and
//! hand the durable write to this queue. Each write is retried with backoff;
//! outcomes are counted so lost writes show up in `/health` instead of vanishing.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::services::retry::{Backoff, Retryable, retry};
use crate::services::storage::service::{StorageError, StorageService};

#[derive(Debug, Clone)]
pub struct PersistOptions {
    // Writes running against the stores at once.
    pub concurrency: usize,
    // Writes accepted but not yet finished (queued + running).
    pub capacity: usize,
    pub backoff: Backoff,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            capacity: 256,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dropped: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Error)]
enum PersistError {
    #[error("no persistent store accepted the write")]
    NotStored,
    #[error(transparent)]
    Rejected(#[from] StorageError),
}

impl Retryable for PersistError {
    fn is_retryable(&self) -> bool {
        matches!(self, PersistError::NotStored)
    }
}

pub struct PersistQueue {
    storage: Arc<StorageService>,
    slots: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    capacity: u32,
    backoff: Backoff,
    counters: Arc<Counters>,
}

impl PersistQueue {
    pub fn new(storage: Arc<StorageService>, options: PersistOptions) -> Self {
        let capacity = u32::try_from(options.capacity.max(1)).unwrap_or(u32::MAX);
        Self {
            storage,
            slots: Arc::new(Semaphore::new(capacity as usize)),
            workers: Arc::new(Semaphore::new(options.concurrency.max(1))),
            capacity,
            backoff: options.backoff,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Queue a durable write. Returns `false` (and counts a drop) when the queue is full.
    pub fn submit(&self, key: String, value: Value, ttl: Option<Duration>) -> bool {
        let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "persist queue full, dropping write");
            return false;
        };

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let storage = Arc::clone(&self.storage);
        let workers = Arc::clone(&self.workers);
        let counters = Arc::clone(&self.counters);
        let backoff = self.backoff;

        tokio::spawn(async move {
            let _slot = slot;
            let outcome = match workers.acquire_owned().await {
                Ok(_worker) => {
                    retry(&backoff, "persist", || persist_once(&storage, &key, &value, ttl)).await
                }
                Err(_) => Err(PersistError::NotStored),
            };

            match outcome {
                Ok(()) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "background persist done");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(key = %key, error = %e, "background persist failed");
                }
            }
            counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        true
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Wait until every accepted write has finished (used on shutdown).
    pub async fn drain(&self) {
        if let Ok(all) = self.slots.acquire_many(self.capacity).await {
            drop(all);
        }
    }
}

async fn persist_once(
    storage: &StorageService,
    key: &str,
    value: &Value,
    ttl: Option<Duration>,
) -> Result<(), PersistError> {
    if storage.persist(key, value, ttl).await? {
        Ok(())
    } else {
        Err(PersistError::NotStored)
    }
}
