use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use super::AppState;

/// Compares the digests so the check does not leak a matching prefix.
fn secrets_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

fn is_loopback(host: &str) -> bool {
    host == "127.0.0.1" || host == "::1" || host == "localhost"
}

fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": msg })),
    )
        .into_response()
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // No token configured: open access only on loopback.
    let Some(expected) = state.api_token.as_deref() else {
        if is_loopback(&state.api_host) {
            return next.run(req).await;
        }
        return unauthorized(
            "No API token configured. Set server.api_token before exposing on a non-loopback address.",
        );
    };

    match bearer_token(req.headers()) {
        Some(token) if secrets_match(token, expected) => next.run(req).await,
        Some(_) => unauthorized("Invalid API token"),
        None => unauthorized("Missing or invalid Authorization header. Use: Bearer <token>"),
    }
}

/// Pulls the cron secret from `x-cron-secret`, a bearer token, or `?secret=`.
fn presented_cron_secret(req: &Request<Body>) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get("x-cron-secret")
        .and_then(|v| v.to_str().ok())
    {
        return Some(value.trim().to_string());
    }
    if let Some(token) = bearer_token(req.headers()) {
        return Some(token.to_string());
    }
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "secret")
        .map(|(_, value)| value.into_owned())
}

/// Guards the dispatch trigger. Unlike the API token, the cron secret is
/// mandatory: with none configured the trigger is disabled.
pub async fn require_cron_secret(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.cron_secret.as_deref().filter(|s| !s.is_empty()) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "Cron secret is not configured" })),
        )
            .into_response();
    };

    match presented_cron_secret(&req) {
        Some(secret) if secrets_match(&secret, expected) => next.run(req).await,
        _ => unauthorized("Invalid or missing cron secret"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::web::handlers::tests::test_state;
    use axum::{Router, middleware, routing::get};
    use serde_json::json;
    use tower::util::ServiceExt;

    fn protected_app(state: AppState) -> Router {
        Router::new()
            .route(
                "/api/ping",
                get(|| async { axum::Json(json!({ "ok": true })).into_response() }),
            )
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::require_auth,
            ))
            .with_state(state)
    }

    fn cron_app(state: AppState) -> Router {
        Router::new()
            .route(
                "/api/scheduled-jobs/run",
                get(|| async { axum::Json(json!({ "ok": true })).into_response() }),
            )
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::require_cron_secret,
            ))
            .with_state(state)
    }

    async fn status_of(app: Router, uri: &str, headers: Vec<(&str, &str)>) -> StatusCode {
        let mut req_builder = Request::builder().uri(uri);
        for (k, v) in headers {
            req_builder = req_builder.header(k, v);
        }
        let req = req_builder
            .body(Body::empty())
            .expect("request should build");
        app.oneshot(req)
            .await
            .expect("oneshot should succeed")
            .status()
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cre"));
        assert!(!secrets_match("", "s3cret"));
    }

    #[tokio::test]
    async fn no_token_on_loopback_allows_request() {
        let state = test_state("127.0.0.1", None, None);
        let status = status_of(protected_app(state), "/api/ping", vec![]).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn no_token_on_non_loopback_rejects_request() {
        let state = test_state("0.0.0.0", None, None);
        let status = status_of(protected_app(state), "/api/ping", vec![]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn configured_token_requires_matching_bearer() {
        let state = test_state("0.0.0.0", Some("tok-1"), None);
        let app = protected_app(state);
        assert_eq!(
            status_of(app.clone(), "/api/ping", vec![]).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(
                app.clone(),
                "/api/ping",
                vec![("authorization", "Bearer nope")]
            )
            .await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(app, "/api/ping", vec![("authorization", "Bearer tok-1")]).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn cron_secret_accepted_from_header_bearer_or_query() {
        let state = test_state("127.0.0.1", None, Some("c-secret"));
        let app = cron_app(state);
        for (uri, headers) in [
            ("/api/scheduled-jobs/run", vec![("x-cron-secret", "c-secret")]),
            (
                "/api/scheduled-jobs/run",
                vec![("authorization", "Bearer c-secret")],
            ),
            ("/api/scheduled-jobs/run?secret=c-secret", vec![]),
        ] {
            assert_eq!(status_of(app.clone(), uri, headers).await, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn wrong_or_missing_cron_secret_is_rejected() {
        let state = test_state("127.0.0.1", None, Some("c-secret"));
        let app = cron_app(state);
        assert_eq!(
            status_of(app.clone(), "/api/scheduled-jobs/run", vec![]).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(app, "/api/scheduled-jobs/run?secret=guess", vec![]).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn unconfigured_cron_secret_disables_the_trigger() {
        let state = test_state("127.0.0.1", None, None);
        let status = status_of(cron_app(state), "/api/scheduled-jobs/run", vec![]).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
