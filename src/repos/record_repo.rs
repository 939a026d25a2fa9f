/*
 * Responsibility
 * - storage_records table (primary store, Postgres)
 * - unique-key upsert / lookup with expiry filter / delete / truncate / expiry sweep
 * - PgPool を受け取り、RepoError で返す
 */
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, types::Json};

use crate::repos::error::{RepoError, RepoResult};
use crate::services::storage::record::PersistentRecord;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS storage_records (
        key         TEXT PRIMARY KEY,
        value       JSONB NOT NULL,
        ttl_seconds BIGINT,
        expire_at   TIMESTAMPTZ,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

const CREATE_EXPIRY_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS storage_records_expire_at_idx
        ON storage_records (expire_at)
        WHERE expire_at IS NOT NULL
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecordRow {
    pub key: String,
    pub value: Json<Value>,
    pub ttl_seconds: Option<i64>,
    pub expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RecordRow> for PersistentRecord {
    fn from(row: RecordRow) -> Self {
        PersistentRecord {
            key: row.key,
            value: row.value.0,
            ttl_seconds: row.ttl_seconds.and_then(|s| u64::try_from(s).ok()),
            expire_at: row.expire_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub async fn ensure_schema(pool: &PgPool) -> RepoResult<()> {
    sqlx::query(CREATE_TABLE).execute(pool).await?;
    sqlx::query(CREATE_EXPIRY_INDEX).execute(pool).await?;
    Ok(())
}

/// Insert or overwrite the record for `key`. `created_at` survives overwrites.
pub async fn upsert(
    pool: &PgPool,
    key: &str,
    value: &Value,
    ttl_seconds: Option<i64>,
    expire_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RepoResult<RecordRow> {
    let row = sqlx::query_as::<_, RecordRow>(
        r#"
        INSERT INTO storage_records (key, value, ttl_seconds, expire_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $5)
        ON CONFLICT (key) DO UPDATE
        SET
            value = EXCLUDED.value,
            ttl_seconds = EXCLUDED.ttl_seconds,
            expire_at = EXCLUDED.expire_at,
            updated_at = EXCLUDED.updated_at
        RETURNING key, value, ttl_seconds, expire_at, created_at, updated_at
        "#,
    )
    .bind(key)
    .bind(Json(value))
    .bind(ttl_seconds)
    .bind(expire_at)
    .bind(now)
    .fetch_one(pool)
    .await
    .map_err(RepoError::from_sqlx)?;

    Ok(row)
}

/// Fetch a record only if it has not expired at `now`.
pub async fn find_active(
    pool: &PgPool,
    key: &str,
    now: DateTime<Utc>,
) -> RepoResult<Option<RecordRow>> {
    let row = sqlx::query_as::<_, RecordRow>(
        r#"
        SELECT key, value, ttl_seconds, expire_at, created_at, updated_at
        FROM storage_records
        WHERE key = $1
            AND (expire_at IS NULL OR expire_at > $2)
        "#,
    )
    .bind(key)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn delete(pool: &PgPool, key: &str) -> RepoResult<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM storage_records
        WHERE key = $1
        "#,
    )
    .bind(key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// DELETE rather than TRUNCATE so the caller gets a row count.
pub async fn delete_all(pool: &PgPool) -> RepoResult<u64> {
    let result = sqlx::query("DELETE FROM storage_records")
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_expired(pool: &PgPool, now: DateTime<Utc>) -> RepoResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM storage_records
        WHERE expire_at IS NOT NULL
            AND expire_at <= $1
        "#,
    )
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
