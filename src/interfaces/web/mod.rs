pub(crate) mod auth;
mod handlers;
mod router;

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::lifecycle::LifecycleComponent;
use crate::core::runner::JobRunner;
use crate::core::schedule::{RunLauncher, ScheduleStore};

pub struct ApiServerConfig {
    pub runner: Arc<JobRunner>,
    pub store: Arc<dyn ScheduleStore>,
    pub launcher: Arc<dyn RunLauncher>,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub api_token: Option<String>,
    pub cron_secret: Option<String>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) runner: Arc<JobRunner>,
    pub(crate) store: Arc<dyn ScheduleStore>,
    /// Used by the dispatch endpoint to start due templates.
    pub(crate) launcher: Arc<dyn RunLauncher>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    pub(crate) api_token: Option<String>,
    pub(crate) cron_secret: Option<String>,
}

impl From<ApiServerConfig> for AppState {
    fn from(config: ApiServerConfig) -> Self {
        Self {
            runner: config.runner,
            store: config.store,
            launcher: config.launcher,
            log_tx: config.log_tx,
            api_host: config.api_host,
            api_port: config.api_port,
            api_token: config.api_token,
            cron_secret: config.cron_secret,
        }
    }
}

pub struct ApiServer {
    state: AppState,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            state: config.into(),
            shutdown: CancellationToken::new(),
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| {
        match msg {
            Ok(log) => Ok(Event::default().data(log)), // SSE properly encodes this
            Err(_) => Ok(Event::default().data("Log stream lagged")),
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- Lifecycle Implementations ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = self.state.clone();
        let addr = format!("{}:{}", state.api_host, state.api_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let app = router::build_api_router(state);
            info!("API Server running at http://{addr}");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.shutdown.cancel();
        Ok(())
    }
}
