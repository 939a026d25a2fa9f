/*
 * Responsibility
 * - v1 の URL 構造を定義
 * - /admin/cache/... (管理用 cache 操作), /records/{key} (保存済みデータ参照)
 * - HTTP cache middleware は /records だけに route_layer で適用
 */
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use crate::middleware::http_cache::http_cache;
use crate::state::AppState;

use crate::api::v1::handlers::{
    admin::{cache_stats, clear_cache, clear_group, delete_by_pattern, delete_key},
    records::get_record,
};

pub fn routes(state: AppState) -> Router<AppState> {
    let records = Router::new()
        .route("/records/{key}", get(get_record))
        .route_layer(middleware::from_fn_with_state(state, http_cache));

    Router::new()
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/clear", post(clear_cache))
        .route("/admin/cache/groups/{group}", delete(clear_group))
        .route("/admin/cache/keys", delete(delete_by_pattern))
        .route("/admin/cache/keys/{key}", delete(delete_key))
        .merge(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::http_cache::X_CACHE;
    use crate::services::test_support::{ToggleStore, app_state, memory_state};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::response::Response;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new()
            .nest("/api/v1", routes(state.clone()))
            .with_state(state)
    }

    async fn call(app: &Router, method: Method, uri: &str) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn json_body(res: Response) -> Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn record_lookup_reads_through_storage_and_caches_the_response() {
        let state = memory_state();
        state
            .storage
            .set("github:octocat:dark", &json!({"count": 42}), None)
            .await
            .unwrap();
        let app = app(state);

        let res = call(&app, Method::GET, "/api/v1/records/github:octocat:dark").await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[X_CACHE], "MISS");
        assert_eq!(json_body(res).await, json!({"count": 42}));

        let res = call(&app, Method::GET, "/api/v1/records/github:octocat:dark").await;
        assert_eq!(res.headers()[X_CACHE], "HIT");
    }

    #[tokio::test]
    async fn unknown_record_is_404() {
        let app = app(memory_state());

        let res = call(&app, Method::GET, "/api/v1/records/github:nobody").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(res).await["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn admin_group_and_pattern_deletes_are_idempotent() {
        let state = memory_state();
        for key in ["a:1", "a:2", "b:1", "b:2"] {
            state.cache.set(key, &1, None).await.unwrap();
        }
        let app = app(state.clone());

        let res = call(&app, Method::DELETE, "/api/v1/admin/cache/groups/a").await;
        assert_eq!(json_body(res).await, json!({"deleted": 2}));
        let res = call(&app, Method::DELETE, "/api/v1/admin/cache/groups/a").await;
        assert_eq!(json_body(res).await, json!({"deleted": 0}));

        let res = call(&app, Method::DELETE, "/api/v1/admin/cache/keys?pattern=b:").await;
        assert_eq!(json_body(res).await, json!({"deleted": 2}));

        let res = call(
            &app,
            Method::DELETE,
            "/api/v1/admin/cache/keys?pattern=%5Eb&regex=true",
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await, json!({"deleted": 0}));
    }

    #[tokio::test]
    async fn invalid_regex_is_a_bad_request() {
        let app = app(memory_state());

        let res = call(
            &app,
            Method::DELETE,
            "/api/v1/admin/cache/keys?pattern=%28unclosed&regex=true",
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"]["code"], "INVALID_PATTERN");
    }

    #[tokio::test]
    async fn key_delete_reaches_the_persistent_store() {
        let primary = ToggleStore::new("primary");
        let state = app_state(Some(&primary));
        state.storage.set("github:octocat", &json!(1), None).await.unwrap();
        let app = app(state);

        let res = call(&app, Method::DELETE, "/api/v1/admin/cache/keys/github:octocat").await;
        assert_eq!(
            json_body(res).await,
            json!({"key": "github:octocat", "deleted": true})
        );
        assert!(!primary.contains("github:octocat"));

        let res = call(&app, Method::DELETE, "/api/v1/admin/cache/keys/github:octocat").await;
        assert_eq!(json_body(res).await["deleted"], false);
    }

    #[tokio::test]
    async fn stats_and_clear() {
        let state = memory_state();
        state.cache.set("a:1", &1, None).await.unwrap();
        let _ = state.cache.get::<i32>("a:1").await;
        let app = app(state);

        let res = call(&app, Method::GET, "/api/v1/admin/cache/stats").await;
        let stats = json_body(res).await;
        assert_eq!(stats["hits"], 1);
        assert_eq!(stats["key_count"], 1);
        assert_eq!(stats["backend"], "memory");

        let res = call(&app, Method::POST, "/api/v1/admin/cache/clear").await;
        assert_eq!(json_body(res).await, json!({"cleared": true}));

        let res = call(&app, Method::GET, "/api/v1/admin/cache/stats").await;
        assert_eq!(json_body(res).await["key_count"], 0);
    }
}
