use async_trait::async_trait;

use crate::services::connection::{ConnectionError, Connector, redact_url};

/// Valkey/Redis connector.
///
/// The handle is redis' multiplexed `ConnectionManager`, which is cheap to clone and
/// shared by every in-flight command.
pub struct ValkeyConnector {
    client: redis::Client,
    endpoint: String,
}

impl ValkeyConnector {
    // Build from a URL like `redis://localhost:6379`. Does not open a socket.
    pub fn new(url: &str) -> Result<Self, ConnectionError> {
        let client = redis::Client::open(url).map_err(classify_redis)?;
        Ok(Self {
            client,
            endpoint: redact_url(url),
        })
    }
}

#[async_trait]
impl Connector for ValkeyConnector {
    type Conn = redis::aio::ConnectionManager;

    fn backend_name(&self) -> &'static str {
        "valkey"
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&self) -> Result<Self::Conn, ConnectionError> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))
    }

    async fn ping(&self, conn: &Self::Conn) -> Result<(), ConnectionError> {
        let mut conn = conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify_redis)?;
        Ok(())
    }

    async fn close(&self, conn: Self::Conn) {
        // The multiplexed connection shuts down once the last clone is dropped.
        drop(conn);
    }
}

/// Map a redis error onto the retryable/non-retryable split.
pub fn classify_redis(e: redis::RedisError) -> ConnectionError {
    if e.is_connection_refusal() {
        ConnectionError::Connect(e.to_string())
    } else if e.is_timeout() {
        ConnectionError::Closed(format!("timed out: {e}"))
    } else if e.is_connection_dropped() || e.is_io_error() {
        ConnectionError::Closed(e.to_string())
    } else {
        ConnectionError::Backend {
            message: e.to_string(),
            retryable: false,
        }
    }
}
