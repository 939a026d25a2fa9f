use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::services::storage::service::StorageService;

/// Periodically remove expired entries from every tier.
///
/// Persistent stores only filter expired rows on read; this task is what
/// actually deletes them. A zero interval disables the sweeper.
pub fn spawn_expiry_sweeper(storage: Arc<StorageService>, every: Duration) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        info!("expiry sweeper disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = storage.purge_expired().await;
            if removed > 0 {
                info!(removed, "expired entries swept");
            } else {
                debug!("expiry sweep found nothing");
            }
        }
    }))
}
