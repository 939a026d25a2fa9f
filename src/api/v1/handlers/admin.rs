/*
 * Responsibility
 * - /admin/cache 系 handler (stats / clear / group / pattern / key 削除)
 * - いずれも冪等: 該当なしでも 0 / false を返すだけでエラーにしない
 */
use axum::{
    Json,
    extract::{Path, Query, State},
};
use tracing::info;

use crate::{
    api::v1::dto::admin::{
        ClearResponse, DeletedCountResponse, DeletedKeyResponse, PatternQuery,
    },
    error::AppError,
    services::cache::{CacheStats, KeyPattern},
    state::AppState,
};

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

pub async fn clear_cache(State(state): State<AppState>) -> Json<ClearResponse> {
    let cleared = state.cache.clear().await;
    info!(cleared, "admin: cache cleared");
    Json(ClearResponse { cleared })
}

pub async fn clear_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Json<DeletedCountResponse> {
    let deleted = state.cache.clear_group(&group).await;
    info!(group = %group, deleted, "admin: cache group cleared");
    Json(DeletedCountResponse { deleted })
}

pub async fn delete_by_pattern(
    State(state): State<AppState>,
    Query(query): Query<PatternQuery>,
) -> Result<Json<DeletedCountResponse>, AppError> {
    query
        .validate()
        .map_err(|msg| AppError::bad_request("INVALID_PATTERN", msg))?;

    let pattern = if query.regex {
        KeyPattern::regex(&query.pattern)?
    } else {
        KeyPattern::substring(query.pattern.as_str())
    };

    let deleted = state.cache.delete_by_pattern(&pattern).await;
    info!(pattern = %query.pattern, regex = query.regex, deleted, "admin: keys deleted by pattern");
    Ok(Json(DeletedCountResponse { deleted }))
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeletedKeyResponse>, AppError> {
    let deleted = state.storage.delete(&key).await?;
    info!(key = %key, deleted, "admin: key deleted");
    Ok(Json(DeletedKeyResponse { key, deleted }))
}
