use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::ScheduledJob;
use crate::core::runner::JobRunner;

/// Starts one run for a due template and returns the new job's id.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn launch(&self, job: &ScheduledJob) -> Result<String>;
}

/// Runs the job in this process.
pub struct LocalLauncher {
    runner: Arc<JobRunner>,
}

impl LocalLauncher {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl RunLauncher for LocalLauncher {
    async fn launch(&self, job: &ScheduledJob) -> Result<String> {
        let id = self.runner.start(job.job_params()).await?;
        Ok(id.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    entry_url: &'a str,
    max_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    job_id: String,
}

/// Starts the job on another instance through its HTTP API.
pub struct RemoteLauncher {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteLauncher {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl RunLauncher for RemoteLauncher {
    async fn launch(&self, job: &ScheduledJob) -> Result<String> {
        let params = job.job_params();
        let body = StartRequest {
            entry_url: &params.entry_url,
            max_steps: params.max_steps,
            prompt: params.prompt.as_deref(),
        };

        let mut req = self
            .client
            .post(format!("{}/api/jobs", self.base_url))
            .json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let res = req
            .send()
            .await
            .with_context(|| format!("reaching {}", self.base_url))?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(anyhow!("remote start failed with HTTP {}: {}", status, snippet));
        }
        let parsed: StartResponse = res.json().await.context("decoding remote start response")?;
        Ok(parsed.job_id)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;

    use super::*;
    use crate::core::schedule::Frequency;

    fn scheduled(prompt: Option<&str>) -> ScheduledJob {
        let now = Utc::now();
        ScheduledJob {
            id: "sched-1".to_string(),
            title: "Competitor".to_string(),
            prompt: prompt.map(str::to_string),
            start_url: "https://funnel.example".to_string(),
            max_turns: 12,
            frequency: Frequency::Daily,
            is_active: true,
            last_run_at: None,
            last_job_id: None,
            last_status: None,
            last_error: None,
            total_runs: 0,
            next_run_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn remote_launch_posts_params_with_bearer_token() {
        let app = Router::new().route(
            "/api/jobs",
            post(
                |headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if auth != "Bearer s3cret" {
                        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({})));
                    }
                    assert_eq!(body["entryUrl"], "https://funnel.example");
                    assert_eq!(body["maxSteps"], 12);
                    assert_eq!(body["prompt"], "find the upsell");
                    (
                        StatusCode::ACCEPTED,
                        Json(serde_json::json!({ "jobId": "remote-42" })),
                    )
                },
            ),
        );
        let base = serve(app).await;

        let launcher = RemoteLauncher::new(format!("{base}/"), Some("s3cret".to_string()));
        let id = launcher
            .launch(&scheduled(Some("find the upsell")))
            .await
            .unwrap();
        assert_eq!(id, "remote-42");
    }

    #[tokio::test]
    async fn remote_error_status_is_reported() {
        let app = Router::new().route(
            "/api/jobs",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "no browser available") }),
        );
        let base = serve(app).await;

        let err = RemoteLauncher::new(base, None)
            .launch(&scheduled(None))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("503"), "{msg}");
        assert!(msg.contains("no browser available"), "{msg}");
    }
}
