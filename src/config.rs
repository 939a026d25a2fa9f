/*
 * Responsibility
 * - 環境変数の読み込み (cache backend, DATABASE_URL, BACKUP_DATABASE_URL, storage strategy など)
 * - 設定値のバリデーション (不正値・必須値の欠落なら起動失敗)
 * - 永続化先が未設定でも起動は継続 (cache_only に縮退するのは StorageService 側)
 */
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::services::retry::Backoff;
use crate::services::storage::{PersistOptions, StorageOptions, StorageStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    fn parse(raw: Option<&str>) -> Self {
        match raw.unwrap_or("development").to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration: {}", key),
            ConfigError::Invalid(key) => write!(f, "invalid configuration: {}", key),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, PartialEq, Eq)]
pub enum CacheBackendKind {
    Memory,
    Valkey { url: String },
    Noop,
}

#[derive(Clone)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub default_ttl: Duration,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

#[derive(Clone)]
pub struct StorageConfig {
    pub options: StorageOptions,
    pub sweep_interval: Duration,
}

pub struct Config {
    pub addr: SocketAddr,
    pub app_env: AppEnv,

    pub cache: CacheConfig,
    // Primary (Postgres) and backup (SQLite document store); both optional.
    pub database: Option<DatabaseConfig>,
    pub backup_database: Option<DatabaseConfig>,
    pub storage: StorageConfig,

    pub reconnect: Backoff,
    pub heartbeat_interval: Duration,
    pub persist: PersistOptions,

    pub http_cache_ttl: Duration,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let port: u16 = vars.parse_or("PORT", 3000)?;
        let addr: SocketAddr = SocketAddr::from_str(&format!("0.0.0.0:{}", port))
            .map_err(|_| ConfigError::Invalid("PORT"))?;

        let app_env = AppEnv::parse(vars.get("APP_ENV").as_deref());

        let backend = match vars
            .get("CACHE_BACKEND")
            .unwrap_or_else(|| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => CacheBackendKind::Memory,
            "noop" | "none" => CacheBackendKind::Noop,
            "valkey" | "redis" => CacheBackendKind::Valkey {
                url: vars
                    .get("VALKEY_URL")
                    .ok_or(ConfigError::Missing("VALKEY_URL"))?,
            },
            _ => return Err(ConfigError::Invalid("CACHE_BACKEND")),
        };

        let cache = CacheConfig {
            backend,
            default_ttl: vars.secs_or("CACHE_DEFAULT_TTL_SECONDS", 7200)?,
            connect_timeout: vars.millis_or("CACHE_CONNECT_TIMEOUT_MS", 5000)?,
            operation_timeout: vars.millis_or("CACHE_OPERATION_TIMEOUT_MS", 2000)?,
        };

        let db_connect_timeout = vars.millis_or("DATABASE_CONNECT_TIMEOUT_MS", 10_000)?;
        let db_operation_timeout = vars.millis_or("DATABASE_OPERATION_TIMEOUT_MS", 5000)?;

        let database = match vars.get("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: vars.parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: vars.parse_or("DATABASE_MIN_CONNECTIONS", 1)?,
                connect_timeout: db_connect_timeout,
                operation_timeout: db_operation_timeout,
            }),
            None => None,
        };

        let backup_database = match vars.get("BACKUP_DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: vars.parse_or("BACKUP_DATABASE_MAX_CONNECTIONS", 4)?,
                min_connections: 1,
                connect_timeout: db_connect_timeout,
                operation_timeout: db_operation_timeout,
            }),
            None => None,
        };

        if let Some(db) = &database
            && db.min_connections > db.max_connections
        {
            return Err(ConfigError::Invalid("DATABASE_MIN_CONNECTIONS"));
        }

        let storage = StorageConfig {
            options: StorageOptions {
                strategy: vars.parse_or("STORAGE_STRATEGY", StorageStrategy::Hybrid)?,
                require_durable_writes: vars.flag_or("STORAGE_REQUIRE_DURABLE_WRITES", false)?,
            },
            sweep_interval: vars.secs_or("STORAGE_SWEEP_INTERVAL_SECONDS", 300)?,
        };

        let reconnect = Backoff::new(
            vars.millis_or("RECONNECT_BASE_MS", 1000)?,
            vars.millis_or("RECONNECT_CAP_MS", 30_000)?,
            vars.parse_or("RECONNECT_MAX_ATTEMPTS", 5)?,
        );
        if reconnect.base.is_zero() || reconnect.base > reconnect.cap {
            return Err(ConfigError::Invalid("RECONNECT_BASE_MS"));
        }

        let heartbeat_interval = vars.secs_or("HEARTBEAT_INTERVAL_SECONDS", 30)?;

        let persist = PersistOptions {
            concurrency: vars.parse_or("PERSIST_CONCURRENCY", 4)?,
            capacity: vars.parse_or("PERSIST_QUEUE_CAPACITY", 256)?,
            backoff: reconnect,
        };

        let http_cache_ttl = vars.secs_or("HTTP_CACHE_TTL_SECONDS", 300)?;
        let request_timeout = vars.secs_or("HTTP_REQUEST_TIMEOUT_SECONDS", 30)?;

        Ok(Self {
            addr,
            app_env,
            cache,
            database,
            backup_database,
            storage,
            reconnect,
            heartbeat_interval,
            persist,
            http_cache_ttl,
            request_timeout,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    // Blank values count as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_or<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key)),
            None => Ok(default),
        }
    }

    fn secs_or(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse_or(key, default).map(Duration::from_secs)
    }

    fn millis_or(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse_or(key, default).map(Duration::from_millis)
    }

    fn flag_or(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(default),
            Some("true" | "1" | "yes" | "on") => Ok(true),
            Some("false" | "0" | "no" | "off") => Ok(false),
            Some(_) => Err(ConfigError::Invalid(key)),
        }
    }
}
