use async_trait::async_trait;
use std::time::Duration;

use crate::services::cache::client::{CacheClient, CacheResult};

/// Cache sink that stores nothing: every read misses, every write "succeeds".
///
/// Lets the rest of the system run with caching structurally disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopClient;

#[async_trait]
impl CacheClient for NoopClient {
    fn backend_name(&self) -> &'static str {
        "noop"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn get_string(&self, _key: &str) -> CacheResult<Option<String>> {
        Ok(None)
    }

    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> CacheResult<()> {
        Ok(())
    }

    async fn del(&self, _key: &str) -> CacheResult<u64> {
        Ok(0)
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn flush(&self) -> CacheResult<()> {
        Ok(())
    }
}
