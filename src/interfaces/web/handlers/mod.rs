pub mod jobs;
pub mod scheduled_jobs;

use axum::{Json, http::StatusCode};

pub(crate) type ApiResponse = (StatusCode, Json<serde_json::Value>);

pub(crate) fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": msg.into() })))
}

/// Accepts only absolute http(s) URLs and returns them normalized.
pub(crate) fn validate_http_url(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("URL is required".to_string());
    }
    let parsed = url::Url::parse(trimmed).map_err(|e| format!("invalid URL '{trimmed}': {e}"))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed.to_string()),
        "http" | "https" => Err(format!("URL '{trimmed}' has no host")),
        other => Err(format!("unsupported URL scheme '{other}'")),
    }
}

pub async fn health_endpoint() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
