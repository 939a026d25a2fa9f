//! Response cache middleware.
//!
//! Caches successful `GET` responses in the cache service under
//! `http:<METHOD>:<path>?<query>`, so the whole set can be invalidated with
//! `DELETE /api/v1/admin/cache/groups/http`. Responses carry `x-cache: HIT|MISS`.

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::services::cache::KeyScheme;
use crate::state::AppState;

pub const X_CACHE: &str = "x-cache";
const MAX_CACHED_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    content_type: Option<String>,
    body: String,
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn http_cache(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let key = cache_key(request.method(), request.uri());

    if let Some(cached) = state.cache.get::<CachedResponse>(&key).await {
        debug!(cache = "http", outcome = "hit", "serving cached response");
        return build_response(cached);
    }

    let mut response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return response;
    }

    // Bodies that are too large, or of unknown size, pass through uncached.
    let cacheable_size = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= MAX_CACHED_BODY_BYTES as u64);
    if !cacheable_size {
        debug!(cache = "http", "response body too large to cache");
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("MISS"));
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_CACHED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "response body could not be buffered");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match std::str::from_utf8(&bytes) {
        Ok(text) => {
            let cached = CachedResponse {
                status: parts.status.as_u16(),
                content_type: parts
                    .headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                body: text.to_string(),
            };
            match state.cache.set(&key, &cached, Some(state.http_cache_ttl)).await {
                Ok(true) => debug!(cache = "http", outcome = "miss", "response cached"),
                Ok(false) => debug!(cache = "http", outcome = "miss", "response not cached"),
                Err(e) => warn!(error = %e, "response could not be cached"),
            }
        }
        Err(_) => debug!("binary response body, not caching"),
    }

    let mut response = Response::from_parts(parts, Body::from(bytes));
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("MISS"));
    response
}

fn cache_key(method: &Method, uri: &Uri) -> String {
    let target = match uri.query() {
        Some(query) => format!("{}?{}", uri.path(), query),
        None => uri.path().to_string(),
    };
    KeyScheme::new("http", method.as_str())
        .with_variant(target)
        .to_string()
}

fn build_response(cached: CachedResponse) -> Response {
    let mut builder = Response::builder()
        .status(cached.status)
        .header(X_CACHE, "HIT");

    if let Some(content_type) = cached
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }

    builder
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::memory_state;
    use axum::{Router, middleware, routing::get};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tower::ServiceExt;

    fn app(state: AppState, calls: Arc<AtomicU32>) -> Router {
        Router::new()
            .route(
                "/records/{key}",
                get(move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        axum::Json(serde_json::json!({ "calls": n }))
                    }
                }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "nope") }),
            )
            .layer(middleware::from_fn_with_state(state.clone(), http_cache))
            .with_state(state)
    }

    async fn send(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(res: Response) -> String {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn key_includes_method_path_and_query() {
        let uri: Uri = "/api/v1/records/github:octocat?theme=dark".parse().unwrap();
        assert_eq!(
            cache_key(&Method::GET, &uri),
            "http:GET:/api/v1/records/github:octocat?theme=dark"
        );

        let uri: Uri = "/health".parse().unwrap();
        assert_eq!(cache_key(&Method::GET, &uri), "http:GET:/health");
    }

    #[tokio::test]
    async fn second_get_is_served_from_cache() {
        let state = memory_state();
        let calls = Arc::new(AtomicU32::new(0));
        let app = app(state.clone(), Arc::clone(&calls));

        let first = send(&app, "/records/a").await;
        assert_eq!(first.headers()[X_CACHE], "MISS");
        assert_eq!(body_text(first).await, r#"{"calls":1}"#);

        let second = send(&app, "/records/a").await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()[X_CACHE], "HIT");
        assert_eq!(
            second.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(body_text(second).await, r#"{"calls":1}"#);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different query string is a different entry.
        let other = send(&app, "/records/a?theme=dark").await;
        assert_eq!(other.headers()[X_CACHE], "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clearing_the_http_group_forces_a_miss() {
        let state = memory_state();
        let calls = Arc::new(AtomicU32::new(0));
        let app = app(state.clone(), Arc::clone(&calls));

        send(&app, "/records/a").await;
        assert_eq!(state.cache.clear_group("http").await, 1);

        let res = send(&app, "/records/a").await;
        assert_eq!(res.headers()[X_CACHE], "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn oversized_responses_pass_through_uncached() {
        let state = memory_state();
        let app = Router::new()
            .route(
                "/big",
                get(|| async { "a".repeat(2 * MAX_CACHED_BODY_BYTES) }),
            )
            .layer(middleware::from_fn_with_state(state.clone(), http_cache))
            .with_state(state.clone());

        let res = send(&app, "/big").await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[X_CACHE], "MISS");
        assert_eq!(body_text(res).await.len(), 2 * MAX_CACHED_BODY_BYTES);
        assert_eq!(state.cache.stats().key_count, 0);
    }

    #[tokio::test]
    async fn non_200_responses_are_not_cached() {
        let state = memory_state();
        let app = app(state.clone(), Arc::new(AtomicU32::new(0)));

        let res = send(&app, "/missing").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(!res.headers().contains_key(X_CACHE));
        assert_eq!(state.cache.stats().key_count, 0);
    }
}
