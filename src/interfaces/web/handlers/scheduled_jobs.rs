use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::{error, info};

use super::{ApiResponse, api_error, validate_http_url};
use crate::core::jobs::{MAX_MAX_STEPS, MIN_MAX_STEPS};
use crate::core::schedule::{NewScheduledJob, ScheduleUpdate, dispatch};
use crate::interfaces::web::AppState;

fn check_max_turns(max_turns: Option<u32>) -> Result<(), String> {
    match max_turns {
        Some(n) if !(MIN_MAX_STEPS..=MAX_MAX_STEPS).contains(&n) => Err(format!(
            "maxTurns must be between {MIN_MAX_STEPS} and {MAX_MAX_STEPS}"
        )),
        _ => Ok(()),
    }
}

fn internal(e: anyhow::Error) -> ApiResponse {
    error!("Scheduled job store error: {:#}", e);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
}

pub async fn list_scheduled_jobs_endpoint(State(state): State<AppState>) -> ApiResponse {
    match state.store.list().await {
        Ok(jobs) => (
            StatusCode::OK,
            Json(serde_json::json!({ "scheduledJobs": jobs })),
        ),
        Err(e) => internal(e),
    }
}

pub async fn create_scheduled_job_endpoint(
    State(state): State<AppState>,
    Json(mut payload): Json<NewScheduledJob>,
) -> ApiResponse {
    payload.title = payload.title.trim().to_string();
    if payload.title.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "title is required");
    }
    payload.start_url = match validate_http_url(&payload.start_url) {
        Ok(url) => url,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
    };
    if let Err(e) = check_max_turns(payload.max_turns) {
        return api_error(StatusCode::BAD_REQUEST, e);
    }

    match state.store.create(payload, Utc::now()).await {
        Ok(job) => {
            info!(schedule_id = %job.id, frequency = job.frequency.as_str(), "scheduled job created");
            (StatusCode::CREATED, Json(serde_json::json!(job)))
        }
        Err(e) => internal(e),
    }
}

pub async fn get_scheduled_job_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get(&id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(serde_json::json!(job))),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "Scheduled job not found"),
        Err(e) => internal(e),
    }
}

pub async fn update_scheduled_job_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(mut fields): Json<ScheduleUpdate>,
) -> ApiResponse {
    if fields.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "no fields to update");
    }
    if let Some(title) = fields.title.as_mut() {
        *title = title.trim().to_string();
        if title.is_empty() {
            return api_error(StatusCode::BAD_REQUEST, "title cannot be empty");
        }
    }
    if let Some(start_url) = fields.start_url.as_deref() {
        match validate_http_url(start_url) {
            Ok(url) => fields.start_url = Some(url),
            Err(e) => return api_error(StatusCode::BAD_REQUEST, e),
        }
    }
    if let Err(e) = check_max_turns(fields.max_turns) {
        return api_error(StatusCode::BAD_REQUEST, e);
    }

    match state.store.update(&id, fields, Utc::now()).await {
        Ok(Some(job)) => (StatusCode::OK, Json(serde_json::json!(job))),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "Scheduled job not found"),
        Err(e) => internal(e),
    }
}

pub async fn delete_scheduled_job_endpoint(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.delete(&id).await {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({ "success": true }))),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "Scheduled job not found"),
        Err(e) => internal(e),
    }
}

/// One dispatcher pass, triggered by an external cron.
pub async fn run_due_jobs_endpoint(State(state): State<AppState>) -> ApiResponse {
    match dispatch(state.store.as_ref(), state.launcher.as_ref(), Utc::now()).await {
        Ok(summary) => (StatusCode::OK, Json(serde_json::json!(summary))),
        Err(e) => {
            error!("Dispatch pass failed: {:#}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}
