/*
 * Responsibility
 * - storage_documents collection (backup store, SQLite)
 * - one JSON document per key; same operations as record_repo
 * - timestamps are unix milliseconds so expiry filters are plain integer comparisons
 */
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqlitePool, types::Json};

use crate::repos::error::{RepoError, RepoResult};
use crate::services::storage::record::PersistentRecord;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS storage_documents (
        key         TEXT PRIMARY KEY NOT NULL,
        document    TEXT NOT NULL,
        ttl_seconds INTEGER,
        expire_at   INTEGER,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    )
"#;

const CREATE_EXPIRY_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS storage_documents_expire_at_idx
        ON storage_documents (expire_at)
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRow {
    pub key: String,
    pub document: Json<Value>,
    pub ttl_seconds: Option<i64>,
    pub expire_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<DocumentRow> for PersistentRecord {
    fn from(row: DocumentRow) -> Self {
        PersistentRecord {
            key: row.key,
            value: row.document.0,
            ttl_seconds: row.ttl_seconds.and_then(|s| u64::try_from(s).ok()),
            expire_at: row.expire_at.and_then(DateTime::from_timestamp_millis),
            created_at: DateTime::from_timestamp_millis(row.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(row.updated_at).unwrap_or_default(),
        }
    }
}

pub async fn ensure_schema(pool: &SqlitePool) -> RepoResult<()> {
    sqlx::query(CREATE_TABLE).execute(pool).await?;
    sqlx::query(CREATE_EXPIRY_INDEX).execute(pool).await?;
    Ok(())
}

pub async fn upsert(
    pool: &SqlitePool,
    key: &str,
    document: &Value,
    ttl_seconds: Option<i64>,
    expire_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RepoResult<DocumentRow> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        INSERT INTO storage_documents (key, document, ttl_seconds, expire_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        ON CONFLICT (key) DO UPDATE
        SET
            document = excluded.document,
            ttl_seconds = excluded.ttl_seconds,
            expire_at = excluded.expire_at,
            updated_at = excluded.updated_at
        RETURNING key, document, ttl_seconds, expire_at, created_at, updated_at
        "#,
    )
    .bind(key)
    .bind(Json(document))
    .bind(ttl_seconds)
    .bind(expire_at.map(|t| t.timestamp_millis()))
    .bind(now.timestamp_millis())
    .fetch_one(pool)
    .await
    .map_err(RepoError::from_sqlx)?;

    Ok(row)
}

pub async fn find_active(
    pool: &SqlitePool,
    key: &str,
    now: DateTime<Utc>,
) -> RepoResult<Option<DocumentRow>> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT key, document, ttl_seconds, expire_at, created_at, updated_at
        FROM storage_documents
        WHERE key = ?1
            AND (expire_at IS NULL OR expire_at > ?2)
        "#,
    )
    .bind(key)
    .bind(now.timestamp_millis())
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn delete(pool: &SqlitePool, key: &str) -> RepoResult<bool> {
    let result = sqlx::query("DELETE FROM storage_documents WHERE key = ?1")
        .bind(key)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_all(pool: &SqlitePool) -> RepoResult<u64> {
    let result = sqlx::query("DELETE FROM storage_documents")
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_expired(pool: &SqlitePool, now: DateTime<Utc>) -> RepoResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM storage_documents
        WHERE expire_at IS NOT NULL
            AND expire_at <= ?1
        "#,
    )
    .bind(now.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
