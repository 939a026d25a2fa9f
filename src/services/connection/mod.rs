//! Connection lifecycle for a single storage backend.
//!
//! One `ConnectionManager` exists per physical backend (Valkey, primary Postgres,
//! backup SQLite document store). It is constructed once at startup and handed to
//! the store/cache client that uses it; nothing else touches its state.
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED
//!                      ^             |
//!                      |          (failure)
//!                      +-------- ERROR -----> DISCONNECTED (retry budget spent)
//! ```
//!
//! - `ensure_connection` probes a live connection, or connects inline.
//! - Connect failures schedule background reconnects with exponential backoff.
//!   Once the budget is spent the manager stays `Disconnected` and only the next
//!   `ensure_connection` call tries again.
//! - A heartbeat task probes the connection periodically so a peer-closed socket
//!   is noticed even when no request is in flight.
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::services::lock::mutex_lock;
use crate::services::retry::{Backoff, Retryable};

pub mod postgres;
pub mod sqlite;
pub mod valkey;

pub use postgres::PostgresConnector;
pub use sqlite::SqliteConnector;
pub use valkey::ValkeyConnector;

const SOURCE: &str = "services::connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("not connected")]
    NotConnected,
    #[error("backend error: {message}")]
    Backend { message: String, retryable: bool },
}

impl Retryable for ConnectionError {
    fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::Connect(_)
            | ConnectionError::Timeout(_)
            | ConnectionError::Closed(_)
            | ConnectionError::NotConnected => true,
            ConnectionError::Backend { retryable, .. } => *retryable,
        }
    }
}

/// Timeouts and recovery knobs for one backend.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub reconnect: Backoff,
    // Zero disables the heartbeat task.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
            reconnect: Backoff::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Backend-specific connect/probe/close. The handle must be cheap to clone
/// (a pool or a multiplexed client).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    fn backend_name(&self) -> &'static str;

    // Endpoint with credentials removed (for logs and status output).
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<Self::Conn, ConnectionError>;

    async fn ping(&self, conn: &Self::Conn) -> Result<(), ConnectionError>;

    async fn close(&self, conn: Self::Conn);
}

/// Read-only snapshot of a manager, safe to surface on health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub backend: &'static str,
    pub endpoint: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Type-erased view of a manager, for health output and shutdown.
#[async_trait]
pub trait ManagedConnection: Send + Sync {
    async fn status(&self) -> ConnectionStatus;

    async fn disconnect(&self);
}

struct Inner<T> {
    state: ConnectionState,
    conn: Option<T>,
    last_error: Option<String>,
}

struct Shared<C: Connector> {
    connector: C,
    settings: ConnectionSettings,
    inner: RwLock<Inner<C::Conn>>,
    // Serializes connect attempts (inline and background).
    connect_lock: Mutex<()>,
    // Bumped when a connect attempt finishes, whatever its outcome.
    connect_generation: AtomicU64,
    attempts: AtomicU32,
    // Set by `disconnect`; suppresses background reconnects until `connect` is called again.
    closed: AtomicBool,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
    heartbeat_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Owns the long-lived client/pool for one backend. Cheap to clone.
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, settings: ConnectionSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                settings,
                inner: RwLock::new(Inner {
                    state: ConnectionState::Disconnected,
                    conn: None,
                    last_error: None,
                }),
                connect_lock: Mutex::new(()),
                connect_generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                reconnect_task: StdMutex::new(None),
                heartbeat_task: StdMutex::new(None),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.connector.backend_name()
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.read().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub async fn status(&self) -> ConnectionStatus {
        let inner = self.shared.inner.read().await;
        ConnectionStatus {
            backend: self.backend_name(),
            endpoint: self.shared.connector.endpoint(),
            state: inner.state,
            reconnect_attempts: self.shared.attempts.load(Ordering::Acquire),
            last_error: inner.last_error.clone(),
        }
    }

    /// Returns `true` when a live connection is available after this call.
    ///
    /// A connected manager is probed first; a failed probe (or no connection)
    /// leads to an inline connect attempt.
    pub async fn ensure_connection(&self) -> bool {
        if let Some(conn) = self.live_conn().await {
            match self.probe(&conn).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(backend = self.backend_name(), error = %e, "liveness probe failed");
                    self.mark_failed(&e).await;
                }
            }
        }

        self.connect().await
    }

    /// Connect if not already connected. Never returns an error: failures are
    /// logged, recorded in the state and handed to the reconnect policy.
    ///
    /// Callers that queue behind an attempt already in flight take its outcome
    /// instead of starting another one, so a hung backend costs each caller at
    /// most one `connect_timeout`.
    pub async fn connect(&self) -> bool {
        self.shared.closed.store(false, Ordering::Release);

        let seen = self.shared.connect_generation.load(Ordering::Acquire);
        let _guard = self.shared.connect_lock.lock().await;
        if self.is_connected().await {
            return true;
        }
        if self.shared.connect_generation.load(Ordering::Acquire) != seen {
            debug!(backend = self.backend_name(), "sharing result of concurrent connect attempt");
            return false;
        }

        match self.try_connect().await {
            Ok(()) => true,
            Err(_) => {
                self.after_connect_failure().await;
                false
            }
        }
    }

    /// Run `op` against the current connection handle under the operation timeout.
    ///
    /// The handle passed to `op` is a clone of the pool/client; pooled sessions
    /// acquired from it are returned when dropped, on every exit path.
    /// Retryable failures mark the connection as broken and start recovery.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(C::Conn) -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        let conn = self.live_conn().await.ok_or(ConnectionError::NotConnected)?;

        let operation_timeout = self.shared.settings.operation_timeout;
        let result = match timeout(operation_timeout, op(conn)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(operation_timeout)),
        };

        if let Err(e) = &result
            && e.is_retryable()
        {
            self.mark_failed(e).await;
        }

        result
    }

    /// Stop background tasks and close the connection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.shared.closed.store(true, Ordering::Release);

        for slot in [&self.shared.reconnect_task, &self.shared.heartbeat_task] {
            let handle = mutex_lock(slot, SOURCE, "disconnect").take();
            if let Some(handle) = handle {
                handle.abort();
            }
        }

        let conn = {
            let mut inner = self.shared.inner.write().await;
            inner.state = ConnectionState::Disconnected;
            inner.conn.take()
        };

        if let Some(conn) = conn {
            self.shared.connector.close(conn).await;
            info!(
                backend = self.backend_name(),
                endpoint = %self.shared.connector.endpoint(),
                "disconnected"
            );
        }
    }

    /// Spawn the periodic liveness probe. No-op if already running or disabled.
    pub fn start_heartbeat(&self) {
        let interval = self.shared.settings.heartbeat_interval;
        if interval.is_zero() {
            return;
        }

        let mut slot = mutex_lock(&self.shared.heartbeat_task, SOURCE, "start_heartbeat");
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let this = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.heartbeat().await;
            }
        }));
    }

    async fn heartbeat(&self) {
        // Recovery of a non-connected manager belongs to the reconnect path.
        let Some(conn) = self.live_conn().await else {
            return;
        };

        match self.probe(&conn).await {
            Ok(()) => debug!(backend = self.backend_name(), "heartbeat ok"),
            Err(e) => {
                warn!(backend = self.backend_name(), error = %e, "heartbeat failed");
                self.mark_failed(&e).await;
            }
        }
    }

    async fn live_conn(&self) -> Option<C::Conn> {
        let inner = self.shared.inner.read().await;
        match inner.state {
            ConnectionState::Connected => inner.conn.clone(),
            _ => None,
        }
    }

    async fn probe(&self, conn: &C::Conn) -> Result<(), ConnectionError> {
        let operation_timeout = self.shared.settings.operation_timeout;
        timeout(operation_timeout, self.shared.connector.ping(conn))
            .await
            .map_err(|_| ConnectionError::Timeout(operation_timeout))?
    }

    // Caller must hold `connect_lock`.
    async fn try_connect(&self) -> Result<(), ConnectionError> {
        let backend = self.backend_name();
        let endpoint = self.shared.connector.endpoint();
        self.shared.inner.write().await.state = ConnectionState::Connecting;

        let connect_timeout = self.shared.settings.connect_timeout;
        let result = match timeout(connect_timeout, self.shared.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(connect_timeout)),
        };
        self.shared.connect_generation.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(conn) => {
                let previous = {
                    let mut inner = self.shared.inner.write().await;
                    inner.state = ConnectionState::Connected;
                    inner.last_error = None;
                    inner.conn.replace(conn)
                };
                self.shared.attempts.store(0, Ordering::Release);
                info!(backend, endpoint = %endpoint, "connected");

                if let Some(previous) = previous {
                    self.shared.connector.close(previous).await;
                }
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = self.shared.inner.write().await;
                    inner.state = ConnectionState::Error;
                    inner.last_error = Some(e.to_string());
                }
                error!(backend, endpoint = %endpoint, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Flag a connection that was believed healthy as broken and start recovery.
    async fn mark_failed(&self, err: &ConnectionError) {
        {
            let mut inner = self.shared.inner.write().await;
            if inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Error;
            inner.last_error = Some(err.to_string());
        }

        warn!(backend = self.backend_name(), error = %err, "connection marked as failed");
        self.after_connect_failure().await;
    }

    async fn after_connect_failure(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }

        if self.shared.attempts.load(Ordering::Acquire) >= self.shared.settings.reconnect.max_attempts {
            self.shared.inner.write().await.state = ConnectionState::Disconnected;
            debug!(
                backend = self.backend_name(),
                "reconnect budget spent, waiting for next ensure_connection"
            );
            return;
        }

        let mut slot = mutex_lock(&self.shared.reconnect_task, SOURCE, "schedule_reconnect");
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let this = self.clone();
        *slot = Some(tokio::spawn(async move { this.reconnect_loop().await }));
    }

    async fn reconnect_loop(self) {
        let backend = self.backend_name();
        let policy = self.shared.settings.reconnect;

        loop {
            let attempt = self.shared.attempts.load(Ordering::Acquire);
            if attempt >= policy.max_attempts {
                self.shared.inner.write().await.state = ConnectionState::Disconnected;
                warn!(
                    backend,
                    attempts = attempt,
                    "giving up on reconnect, backend stays degraded until next use"
                );
                return;
            }
            self.shared.attempts.store(attempt + 1, Ordering::Release);

            let delay = policy.delay(attempt);
            info!(
                backend,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            if self.shared.closed.load(Ordering::Acquire) {
                return;
            }

            let _guard = self.shared.connect_lock.lock().await;
            if self.is_connected().await {
                self.shared.attempts.store(0, Ordering::Release);
                return;
            }
            if self.try_connect().await.is_ok() {
                return;
            }
        }
    }
}

#[async_trait]
impl<C: Connector> ManagedConnection for ConnectionManager<C> {
    async fn status(&self) -> ConnectionStatus {
        ConnectionManager::status(self).await
    }

    async fn disconnect(&self) {
        ConnectionManager::disconnect(self).await
    }
}

/// Strip the password from a connection URL before it reaches logs.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Clone, Default)]
    struct FakeConnector {
        fail_connect: Arc<AtomicBool>,
        hang_connect: Arc<AtomicBool>,
        fail_ping: Arc<AtomicBool>,
        connects: Arc<AtomicU32>,
        attempted_at: Arc<StdMutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Conn = u32;

        fn backend_name(&self) -> &'static str {
            "fake"
        }

        fn endpoint(&self) -> String {
            "fake://localhost".to_string()
        }

        async fn connect(&self) -> Result<u32, ConnectionError> {
            self.attempted_at.lock().unwrap().push(Instant::now());
            if self.hang_connect.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ConnectionError::Connect("connection refused".into()));
            }
            Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn ping(&self, _conn: &u32) -> Result<(), ConnectionError> {
            if self.fail_ping.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed("peer closed".into()));
            }
            Ok(())
        }

        async fn close(&self, _conn: u32) {}
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(500),
            operation_timeout: Duration::from_millis(200),
            reconnect: Backoff::new(Duration::from_secs(1), Duration::from_secs(4), 5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn ensure_connection_connects_lazily_once() {
        let connector = FakeConnector::default();
        let manager = ConnectionManager::new(connector.clone(), settings());
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        assert!(manager.ensure_connection().await);
        assert!(manager.ensure_connection().await);
        assert!(manager.connect().await);

        assert_eq!(manager.state().await, ConnectionState::Connected);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delays_are_non_decreasing_and_capped() {
        let connector = FakeConnector::default();
        connector.fail_connect.store(true, Ordering::SeqCst);
        let manager = ConnectionManager::new(connector.clone(), settings());

        assert!(!manager.connect().await);
        tokio::time::sleep(Duration::from_secs(120)).await;

        let attempts = connector.attempted_at.lock().unwrap().clone();
        // one inline attempt plus five scheduled ones
        assert_eq!(attempts.len(), 6);

        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "gaps must not shrink: {gaps:?}");
        }
        assert!(gaps.iter().all(|g| *g <= Duration::from_secs(4)));
        assert_eq!(gaps[0], Duration::from_secs(1));

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(manager.status().await.reconnect_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_hung_connect_attempt() {
        let connector = FakeConnector::default();
        connector.hang_connect.store(true, Ordering::SeqCst);
        let manager = ConnectionManager::new(connector.clone(), settings());

        let mut callers = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let manager = manager.clone();
            callers.spawn(async move {
                let started = Instant::now();
                let connected = manager.ensure_connection().await;
                (connected, started.elapsed())
            });
        }

        let mut worst = Duration::ZERO;
        while let Some(joined) = callers.join_next().await {
            let (connected, waited) = joined.unwrap();
            assert!(!connected);
            worst = worst.max(waited);
        }

        assert!(worst <= Duration::from_millis(500), "worst wait {worst:?}");
        assert_eq!(connector.attempted_at.lock().unwrap().len(), 1);
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_manager_recovers_on_next_ensure() {
        let connector = FakeConnector::default();
        connector.fail_connect.store(true, Ordering::SeqCst);
        let manager = ConnectionManager::new(connector.clone(), settings());

        assert!(!manager.ensure_connection().await);
        tokio::time::sleep(Duration::from_secs(120)).await;
        let attempts_before = connector.attempted_at.lock().unwrap().len();

        // Nothing retries on its own once the budget is spent.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempted_at.lock().unwrap().len(), attempts_before);

        connector.fail_connect.store(false, Ordering::SeqCst);
        assert!(manager.ensure_connection().await);
        assert_eq!(manager.status().await.reconnect_attempts, 0);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_detects_dead_connection_and_reconnects() {
        let connector = FakeConnector::default();
        let manager = ConnectionManager::new(connector.clone(), settings());
        assert!(manager.connect().await);
        manager.start_heartbeat();

        connector.fail_ping.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30_500)).await;
        assert_ne!(manager.state().await, ConnectionState::Connected);

        connector.fail_ping.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.state().await, ConnectionState::Connected);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn execute_marks_only_retryable_failures() {
        let connector = FakeConnector::default();
        let manager = ConnectionManager::new(connector, settings());
        assert!(manager.connect().await);

        let rejected: Result<(), _> = manager
            .execute(|_| async {
                Err(ConnectionError::Backend {
                    message: "duplicate key".into(),
                    retryable: false,
                })
            })
            .await;
        assert!(rejected.is_err());
        assert_eq!(manager.state().await, ConnectionState::Connected);

        let closed: Result<(), _> = manager
            .execute(|_| async { Err(ConnectionError::Closed("socket closed".into())) })
            .await;
        assert!(closed.is_err());
        assert_ne!(manager.state().await, ConnectionState::Connected);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn execute_times_out_slow_operations() {
        let manager = ConnectionManager::new(FakeConnector::default(), settings());
        assert!(manager.connect().await);

        let result: Result<(), _> = manager
            .execute(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let manager = ConnectionManager::new(FakeConnector::default(), settings());
        assert!(manager.connect().await);

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        let result: Result<u32, _> = manager.execute(|conn| async move { Ok(conn) }).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }

    #[test]
    fn redact_url_hides_password() {
        assert_eq!(
            redact_url("postgres://badge:secret@db:5432/badges"),
            "postgres://badge:***@db:5432/badges"
        );
        assert_eq!(redact_url("redis://localhost:6379"), "redis://localhost:6379");
    }
}
