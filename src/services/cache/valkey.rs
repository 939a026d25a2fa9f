use async_trait::async_trait;
use std::time::Duration;

use crate::services::cache::client::{CacheClient, CacheError, CacheResult};
use crate::services::connection::{ConnectionManager, ValkeyConnector, valkey::classify_redis};

const SCAN_BATCH: u64 = 500;

/// Valkey/Redis-backed cache client.
///
/// Every command first goes through `ensure_connection` on the shared
/// `ConnectionManager`, so a dead socket is noticed and recovered before the write.
#[derive(Clone)]
pub struct ValkeyClient {
    manager: ConnectionManager<ValkeyConnector>,
}

impl ValkeyClient {
    pub fn new(manager: ConnectionManager<ValkeyConnector>) -> Self {
        Self { manager }
    }

    async fn ready(&self) -> CacheResult<()> {
        if self.manager.ensure_connection().await {
            Ok(())
        } else {
            Err(CacheError::BackendConnection("valkey is not reachable".into()))
        }
    }
}

#[async_trait]
impl CacheClient for ValkeyClient {
    fn backend_name(&self) -> &'static str {
        "valkey"
    }

    async fn is_available(&self) -> bool {
        self.manager.is_connected().await
    }

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        self.ready().await?;
        let resp = self
            .manager
            .execute(|mut conn| async move {
                let resp: Option<String> = redis::cmd("GET")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(classify_redis)?;
                Ok(resp)
            })
            .await?;

        Ok(resp)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.ready().await?;

        // EX expects integer seconds. We clamp to at least 1 sec.
        let ttl_seconds: u64 = ttl.as_secs().max(1);

        self.manager
            .execute(|mut conn| async move {
                // `SET key value EX <seconds>` overwrites any previous value.
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl_seconds)
                    .query_async(&mut conn)
                    .await
                    .map_err(classify_redis)?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<u64> {
        self.ready().await?;
        let n = self
            .manager
            .execute(|mut conn| async move {
                // DEL returns number of keys removed (0 or 1 for a single key).
                let n: u64 = redis::cmd("DEL")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(classify_redis)?;
                Ok(n)
            })
            .await?;

        Ok(n)
    }

    async fn del_many(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.ready().await?;

        let mut removed = 0;
        for chunk in keys.chunks(SCAN_BATCH as usize) {
            let n: u64 = self
                .manager
                .execute(|mut conn| async move {
                    redis::cmd("DEL")
                        .arg(chunk)
                        .query_async(&mut conn)
                        .await
                        .map_err(classify_redis)
                })
                .await?;
            removed += n;
        }

        Ok(removed)
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        self.ready().await?;

        // One SCAN round trip per `execute`, so each batch gets its own operation timeout.
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .manager
                .execute(|mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                        .map_err(classify_redis)
                })
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn flush(&self) -> CacheResult<()> {
        self.ready().await?;
        self.manager
            .execute(|mut conn| async move {
                let _: () = redis::cmd("FLUSHDB")
                    .query_async(&mut conn)
                    .await
                    .map_err(classify_redis)?;
                Ok(())
            })
            .await?;

        Ok(())
    }
}
