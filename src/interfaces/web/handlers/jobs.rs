use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream;
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::{ApiResponse, api_error, validate_http_url};
use crate::core::browser::Viewport;
use crate::core::jobs::{Job, JobId, JobParams, JobRegistry, clamp_max_steps};
use crate::interfaces::web::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobRequest {
    pub entry_url: String,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub viewport_width: Option<u32>,
    #[serde(default)]
    pub viewport_height: Option<u32>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub capture_screenshots: Option<bool>,
    #[serde(default)]
    pub extract_links: Option<bool>,
}

pub async fn start_job_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<StartJobRequest>,
) -> ApiResponse {
    let entry_url = match validate_http_url(&payload.entry_url) {
        Ok(url) => url,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
    };

    let params = JobParams {
        entry_url,
        max_steps: clamp_max_steps(Some(
            payload
                .max_steps
                .unwrap_or_else(|| state.runner.default_max_steps()),
        )),
        viewport: Viewport::new(payload.viewport_width, payload.viewport_height),
        prompt: payload
            .prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty()),
        capture_screenshots: payload.capture_screenshots.unwrap_or(true),
        extract_links: payload.extract_links.unwrap_or(false),
    };

    match state.runner.start(params).await {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "jobId": id })),
        ),
        Err(e) => {
            warn!("Refusing job, browser unavailable: {}", e);
            api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("browser unavailable: {e}"),
            )
        }
    }
}

pub async fn list_jobs_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let jobs = state.runner.registry().list().await;
    Json(serde_json::json!({ "jobs": jobs }))
}

pub async fn get_job_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.runner.registry().get(&JobId::from(id)).await {
        Some(job) => Json(job).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Job not found or expired").into_response(),
    }
}

struct EventCursor {
    registry: JobRegistry,
    receiver: broadcast::Receiver<Job>,
    id: JobId,
    pending: Option<Job>,
    finished: bool,
}

impl EventCursor {
    fn emit(mut self, job: Job) -> Option<(Result<Event, axum::Error>, Self)> {
        self.finished = job.status.is_terminal();
        Some((Event::default().event("job").json_data(&job), self))
    }

    async fn next(mut self) -> Option<(Result<Event, axum::Error>, Self)> {
        if self.finished {
            return None;
        }
        if let Some(job) = self.pending.take() {
            return self.emit(job);
        }
        loop {
            match self.receiver.recv().await {
                Ok(job) if job.id == self.id => return self.emit(job),
                Ok(_) => continue,
                // Missed some snapshots: the registry holds the latest one.
                Err(RecvError::Lagged(_)) => {
                    let job = self.registry.get(&self.id).await?;
                    return self.emit(job);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Pushes the job's snapshot on every change, starting with the current one,
/// and closes after the terminal snapshot.
pub async fn job_events_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let registry = state.runner.registry().clone();
    let id = JobId::from(id);
    // Subscribe first so nothing lands between the snapshot and the stream.
    let receiver = registry.subscribe();
    let Some(current) = registry.get(&id).await else {
        return api_error(StatusCode::NOT_FOUND, "Job not found or expired").into_response();
    };

    let cursor = EventCursor {
        registry,
        receiver,
        id,
        pending: Some(current),
        finished: false,
    };
    let events = stream::unfold(cursor, EventCursor::next);
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Body,
        http::{Method, Request},
    };
    use tower::util::ServiceExt;

    use super::*;
    use crate::core::jobs::{JobOutcome, JobPatch, JobResult, JobStatus};
    use crate::core::runner::tests::{
        FakeExecutor, FakeLauncher, ScriptedVision, done, poll_until_terminal, runner_with,
        scroll, test_config,
    };
    use crate::interfaces::web::router::build_api_router;
    use crate::interfaces::web::handlers::tests::{state_with_runner, test_state};

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn start_then_poll_to_max_turns() {
        let (executor, probe) = FakeExecutor::new();
        let runner = runner_with(
            FakeLauncher::with(executor),
            ScriptedVision::always(scroll()),
            &test_config(),
        );
        let state = state_with_runner(runner.clone(), "127.0.0.1", None, None);
        let app = build_api_router(state);

        let (status, body) = json_request(
            app.clone(),
            Method::POST,
            "/api/jobs",
            Some(serde_json::json!({ "entryUrl": "https://example.com", "maxSteps": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["jobId"].as_str().unwrap().to_string();

        poll_until_terminal(runner.registry(), &JobId::from(job_id.clone())).await;
        let (status, job) =
            json_request(app, Method::GET, &format!("/api/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "max_turns_reached");
        assert_eq!(job["currentStep"], 5);
        assert_eq!(job["totalSteps"], 5);
        assert!(job["error"].is_null());
        assert_eq!(job["result"]["steps"].as_array().unwrap().len(), 5);
        assert_eq!(probe.closes(), 1);
    }

    #[tokio::test]
    async fn max_steps_is_clamped() {
        let (executor, _probe) = FakeExecutor::new();
        let runner = runner_with(
            FakeLauncher::with(executor),
            ScriptedVision::always(done("ok")),
            &test_config(),
        );
        let app = build_api_router(state_with_runner(runner, "127.0.0.1", None, None));

        let (_, body) = json_request(
            app.clone(),
            Method::POST,
            "/api/jobs",
            Some(serde_json::json!({ "entryUrl": "https://example.com", "maxSteps": 1 })),
        )
        .await;
        let job_id = body["jobId"].as_str().unwrap();
        let (_, job) =
            json_request(app, Method::GET, &format!("/api/jobs/{job_id}"), None).await;
        assert_eq!(job["totalSteps"], 3);
    }

    #[tokio::test]
    async fn invalid_entry_url_is_a_bad_request() {
        let app = build_api_router(test_state("127.0.0.1", None, None));
        let (status, body) = json_request(
            app,
            Method::POST,
            "/api/jobs",
            Some(serde_json::json!({ "entryUrl": "not a url" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid URL"));
    }

    #[tokio::test]
    async fn launch_failure_is_503_and_allocates_nothing() {
        let state = test_state("127.0.0.1", None, None);
        let registry = state.runner.registry().clone();
        let app = build_api_router(state);
        let (status, body) = json_request(
            app,
            Method::POST,
            "/api/jobs",
            Some(serde_json::json!({ "entryUrl": "https://example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("browser unavailable"));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let app = build_api_router(test_state("127.0.0.1", None, None));
        let (status, _) = json_request(app.clone(), Method::GET, "/api/jobs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) =
            json_request(app, Method::GET, "/api/jobs/nope/events", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_returns_every_job() {
        let state = test_state("127.0.0.1", None, None);
        let registry = state.runner.registry().clone();
        registry.create(JobParams::new("https://a.example")).await;
        registry.create(JobParams::new("https://b.example")).await;
        let (status, body) =
            json_request(build_api_router(state), Method::GET, "/api/jobs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn events_stream_ends_after_terminal_snapshot() {
        let state = test_state("127.0.0.1", None, None);
        let registry = state.runner.registry().clone();
        let id = registry.create(JobParams::new("https://example.com")).await;
        registry.update(&id, JobPatch::status(JobStatus::Running)).await;
        registry
            .finish(&id, JobOutcome::Completed(JobResult::default()))
            .await;

        let req = Request::builder()
            .uri(format!("/api/jobs/{id}/events"))
            .body(Body::empty())
            .unwrap();
        let resp = build_api_router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.matches("event: job").count(), 1);
        assert!(text.contains("\"status\":\"completed\""));
    }

    #[tokio::test]
    async fn events_follow_a_live_job() {
        let state = test_state("127.0.0.1", None, None);
        let registry = state.runner.registry().clone();
        let id = registry.create(JobParams::new("https://example.com")).await;

        let req = Request::builder()
            .uri(format!("/api/jobs/{id}/events"))
            .body(Body::empty())
            .unwrap();
        let resp = build_api_router(state).oneshot(req).await.unwrap();

        let writer = registry.clone();
        let writer_id = id.clone();
        tokio::spawn(async move {
            writer
                .update(&writer_id, JobPatch::status(JobStatus::Running))
                .await;
            writer
                .finish(&writer_id, JobOutcome::Failed("element vanished".to_string()))
                .await;
        });

        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.matches("event: job").count(), 3);
        let pending = text.find("\"status\":\"pending\"").unwrap();
        let running = text.find("\"status\":\"running\"").unwrap();
        let failed = text.find("\"status\":\"failed\"").unwrap();
        assert!(pending < running && running < failed);
        assert!(text.contains("element vanished"));
    }
}
