use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::repos::{error::RepoError, record_repo};
use crate::services::connection::{ConnectionError, Connector, redact_url};

/// Primary persistent store connector (Postgres pool).
pub struct PostgresConnector {
    url: String,
    max_connections: u32,
    min_connections: u32,
    acquire_timeout: Duration,
}

impl PostgresConnector {
    pub fn new(
        url: impl Into<String>,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            max_connections,
            min_connections,
            acquire_timeout,
        }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Conn = PgPool;

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn endpoint(&self) -> String {
        redact_url(&self.url)
    }

    async fn connect(&self) -> Result<PgPool, ConnectionError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.url)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        if let Err(e) = record_repo::ensure_schema(&pool).await {
            pool.close().await;
            return Err(e.into());
        }

        Ok(pool)
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), ConnectionError> {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map_err(|e| ConnectionError::from(RepoError::from(e)))?;
        Ok(())
    }

    async fn close(&self, pool: PgPool) {
        pool.close().await;
    }
}
