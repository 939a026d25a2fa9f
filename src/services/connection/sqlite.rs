use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::repos::{document_repo, error::RepoError};
use crate::services::connection::{ConnectionError, Connector, redact_url};

/// Backup document store connector (SQLite file, e.g. `sqlite://data/backup.db`).
///
/// A `:memory:` database lives only as long as its connection, so the pool is
/// pinned to exactly one connection that never idles out.
pub struct SqliteConnector {
    url: String,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(url: impl Into<String>, max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            max_connections,
            acquire_timeout,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    type Conn = SqlitePool;

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn endpoint(&self) -> String {
        redact_url(&self.url)
    }

    async fn connect(&self) -> Result<SqlitePool, ConnectionError> {
        let options = SqliteConnectOptions::from_str(&self.url)
            .map_err(|e| ConnectionError::Backend {
                message: e.to_string(),
                retryable: false,
            })?
            .create_if_missing(true);

        let pool_options = SqlitePoolOptions::new().acquire_timeout(self.acquire_timeout);
        let pool_options = if self.is_in_memory() {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(self.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        if let Err(e) = document_repo::ensure_schema(&pool).await {
            pool.close().await;
            return Err(e.into());
        }

        Ok(pool)
    }

    async fn ping(&self, pool: &SqlitePool) -> Result<(), ConnectionError> {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map_err(|e| ConnectionError::from(RepoError::from(e)))?;
        Ok(())
    }

    async fn close(&self, pool: SqlitePool) {
        pool.close().await;
    }
}
