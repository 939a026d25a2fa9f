/*
 * Responsibility
 * - GET /records/{key}: StorageService 経由で保存済み JSON を返す
 * - HTTP cache middleware の対象 (routes 側で route_layer)
 */
use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::Value;

use crate::{error::AppError, state::AppState};

pub async fn get_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, AppError> {
    let value = state
        .storage
        .get::<Value>(&key)
        .await?
        .ok_or(AppError::not_found("record"))?;

    Ok(Json(value))
}
