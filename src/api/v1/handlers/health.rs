/*
 * Responsibility
 * - GET /health
 * - cache stats / storage status / persist queue / connection 状態をそのまま返す (副作用なし)
 */
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::api::v1::dto::health::HealthResponse;
use crate::services::storage::FallbackMode;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let storage = state.storage.storage_status().await;

    let mut connections = Vec::with_capacity(state.connections.len());
    for connection in state.connections.iter() {
        connections.push(connection.status().await);
    }

    let (code, status) = match storage.fallback_mode {
        FallbackMode::None => (StatusCode::OK, "ok"),
        FallbackMode::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        _ => (StatusCode::OK, "degraded"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            cache: state.cache.stats(),
            storage,
            persist: state.persist.stats(),
            connections,
        }),
    )
}
