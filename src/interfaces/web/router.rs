use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::AppState;
use super::auth;
use super::handlers::{self, jobs, scheduled_jobs};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // Liveness and the cron trigger bypass token auth; the trigger has its own secret.
    let public_routes = Router::new()
        .route("/api/health", get(handlers::health_endpoint))
        .route(
            "/api/scheduled-jobs/run",
            get(scheduled_jobs::run_due_jobs_endpoint).layer(middleware::from_fn_with_state(
                state.clone(),
                auth::require_cron_secret,
            )),
        )
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route(
            "/api/jobs",
            get(jobs::list_jobs_endpoint).post(jobs::start_job_endpoint),
        )
        .route("/api/jobs/{id}", get(jobs::get_job_endpoint))
        .route("/api/jobs/{id}/events", get(jobs::job_events_endpoint))
        .route(
            "/api/scheduled-jobs",
            get(scheduled_jobs::list_scheduled_jobs_endpoint)
                .post(scheduled_jobs::create_scheduled_job_endpoint),
        )
        .route(
            "/api/scheduled-jobs/{id}",
            get(scheduled_jobs::get_scheduled_job_endpoint)
                .patch(scheduled_jobs::update_scheduled_job_endpoint)
                .delete(scheduled_jobs::delete_scheduled_job_endpoint),
        )
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    public_routes
        .merge(authed_routes)
        .layer(build_localhost_cors(state.api_port))
        .layer(TraceLayer::new_for_http())
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}
