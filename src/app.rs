/*
 * Responsibility
 * - Config読み込み → backend 接続 (Valkey / Postgres / SQLite) → Service 組み立て → Router 組み立て
 * - Middleware の適用 (request id / trace / timeout)
 * - axum::serve() で起動し、停止時は persist queue を drain してから接続を閉じる
 */
use std::{panic, process, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{Router, routing::get};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api;
use crate::api::v1::handlers::health::health;
use crate::config::{CacheBackendKind, Config, DatabaseConfig};
use crate::middleware;
use crate::services::cache::{CacheClient, CacheService, MemoryClient, NoopClient, ValkeyClient};
use crate::services::connection::{
    ConnectionManager, ConnectionSettings, Connector, ManagedConnection,
    postgres::PostgresConnector, sqlite::SqliteConnector, valkey::ValkeyConnector,
};
use crate::services::storage::{
    PersistQueue, PostgresRecordStore, RecordStore, SqliteDocumentStore, StorageService,
    spawn_expiry_sweeper,
};
use crate::state::AppState;

fn init_tracing() {
    // RUST_LOG wins if set.
    // Ex:
    // RUST_LOG=info,badge_cache=debug,tower_http=debug cargo run
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_panic_hook(abort_on_panic: bool) {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        tracing::error!(?info, "panic");

        // Development: crash the whole process so it gets noticed.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

/// Everything `run` has to tear down after the server stops.
struct Services {
    state: AppState,
    sweeper: Option<JoinHandle<()>>,
}

pub async fn run() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    init_panic_hook(!config.app_env.is_production());

    tracing::info!(
        "starting badge cache in {:?} mode on {}",
        config.app_env,
        config.addr
    );

    let Services { state, sweeper } = build_services(&config).await?;
    let app = build_router(state.clone(), config.request_timeout);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped, flushing pending writes");
    state.persist.drain().await;
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    for connection in state.connections.iter() {
        connection.disconnect().await;
    }
    tracing::info!(persist = ?state.persist.stats(), "shutdown complete");

    Ok(())
}

async fn build_services(config: &Config) -> Result<Services> {
    let mut connections: Vec<Arc<dyn ManagedConnection>> = Vec::new();

    let cache_settings = ConnectionSettings {
        connect_timeout: config.cache.connect_timeout,
        operation_timeout: config.cache.operation_timeout,
        reconnect: config.reconnect,
        heartbeat_interval: config.heartbeat_interval,
    };
    let client: Arc<dyn CacheClient> = match &config.cache.backend {
        CacheBackendKind::Memory => Arc::new(MemoryClient::default()),
        CacheBackendKind::Noop => Arc::new(NoopClient),
        CacheBackendKind::Valkey { url } => {
            let manager = ConnectionManager::new(ValkeyConnector::new(url)?, cache_settings);
            start(&manager).await;
            connections.push(Arc::new(manager.clone()));
            Arc::new(ValkeyClient::new(manager))
        }
    };
    let cache = Arc::new(CacheService::new(client, config.cache.default_ttl));

    let primary: Option<Arc<dyn RecordStore>> = match &config.database {
        Some(db) => {
            let connector = PostgresConnector::new(
                db.url.clone(),
                db.max_connections,
                db.min_connections,
                db.connect_timeout,
            );
            let manager = ConnectionManager::new(connector, database_settings(db, config));
            start(&manager).await;
            connections.push(Arc::new(manager.clone()));
            Some(Arc::new(PostgresRecordStore::new(manager)))
        }
        None => None,
    };

    let backup: Option<Arc<dyn RecordStore>> = match &config.backup_database {
        Some(db) => {
            let connector =
                SqliteConnector::new(db.url.clone(), db.max_connections, db.connect_timeout);
            let manager = ConnectionManager::new(connector, database_settings(db, config));
            start(&manager).await;
            connections.push(Arc::new(manager.clone()));
            Some(Arc::new(SqliteDocumentStore::new(manager)))
        }
        None => None,
    };

    let storage = Arc::new(StorageService::new(
        cache,
        primary,
        backup,
        config.storage.options,
    ));
    let persist = Arc::new(PersistQueue::new(Arc::clone(&storage), config.persist.clone()));
    let sweeper = spawn_expiry_sweeper(Arc::clone(&storage), config.storage.sweep_interval);

    Ok(Services {
        state: AppState::new(storage, persist, connections, config.http_cache_ttl),
        sweeper,
    })
}

fn database_settings(db: &DatabaseConfig, config: &Config) -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: db.connect_timeout,
        operation_timeout: db.operation_timeout,
        reconnect: config.reconnect,
        heartbeat_interval: config.heartbeat_interval,
    }
}

/// Connect once and start the heartbeat. A backend that is down at startup is
/// not fatal; the manager keeps reconnecting in the background.
async fn start<C: Connector>(manager: &ConnectionManager<C>) {
    if !manager.connect().await {
        tracing::warn!(
            backend = manager.backend_name(),
            "backend unreachable at startup, continuing degraded"
        );
    }
    manager.start_heartbeat();
}

fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api::v1::routes(state.clone()))
        .with_state(state);

    middleware::http::apply(router, request_timeout)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
