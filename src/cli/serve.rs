use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::browser::ChromeLauncher;
use crate::core::config::{AppConfig, LauncherKind, ScheduleConfig};
use crate::core::jobs::JobRegistry;
use crate::core::lifecycle::{LifecycleManager, schedule_dispatch, schedule_registry_eviction};
use crate::core::runner::JobRunner;
use crate::core::schedule::{
    LocalLauncher, RemoteLauncher, RunLauncher, ScheduleStore, SqliteScheduleStore,
};
use crate::core::terminal;
use crate::core::vision::build_vision_client;
use crate::interfaces::web::{ApiServer, ApiServerConfig};

pub(super) fn build_runner(config: &AppConfig) -> Result<Arc<JobRunner>> {
    let browser = Arc::new(ChromeLauncher::new(
        config.runner.headless,
        config.runner.chrome_path.clone(),
        Duration::from_secs(config.runner.action_timeout_secs),
    ));
    let vision = build_vision_client(&config.vision)?;
    Ok(Arc::new(JobRunner::new(
        JobRegistry::new(),
        browser,
        vision,
        &config.runner,
    )))
}

pub(super) fn open_store(config: &AppConfig) -> Result<Arc<dyn ScheduleStore>> {
    let path = config.database_path();
    let store = SqliteScheduleStore::open(&path)?;
    info!("Schedule database: {}", path.display());
    Ok(Arc::new(store))
}

/// Picks how the dispatcher starts runs. A local launcher needs this process's runner.
pub(super) fn build_run_launcher(
    schedule: &ScheduleConfig,
    runner: Option<Arc<JobRunner>>,
) -> Result<Arc<dyn RunLauncher>> {
    match schedule.launcher {
        LauncherKind::Local => {
            let runner =
                runner.ok_or_else(|| anyhow!("the local launcher needs a job runner"))?;
            Ok(Arc::new(LocalLauncher::new(runner)))
        }
        LauncherKind::Remote => {
            let base_url = schedule
                .remote_base_url
                .clone()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| {
                    anyhow!("schedule.launcher = \"remote\" requires schedule.remote_base_url")
                })?;
            Ok(Arc::new(RemoteLauncher::new(
                base_url,
                schedule.remote_token.clone(),
            )))
        }
    }
}

fn job_ttl(config: &AppConfig) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(config.runner.job_ttl_secs))
        .unwrap_or_else(|_| chrono::Duration::hours(1))
}

pub(super) async fn run_server(
    config: AppConfig,
    log_tx: tokio::sync::broadcast::Sender<String>,
) -> Result<()> {
    let runner = build_runner(&config)?;
    let store = open_store(&config)?;
    let launcher = build_run_launcher(&config.schedule, Some(runner.clone()))?;

    let mut lifecycle = LifecycleManager::new().await?;
    schedule_registry_eviction(&lifecycle, runner.registry().clone(), job_ttl(&config)).await?;
    if let Some(expr) = config
        .schedule
        .internal_cron
        .as_deref()
        .filter(|e| !e.trim().is_empty())
    {
        schedule_dispatch(&lifecycle, expr, store.clone(), launcher.clone()).await?;
    }
    if config.schedule.cron_secret.is_none() {
        warn!("No cron secret configured; GET /api/scheduled-jobs/run is disabled.");
    }

    let api = ApiServer::new(ApiServerConfig {
        runner,
        store,
        launcher,
        log_tx,
        api_host: config.server.host.clone(),
        api_port: config.server.port,
        api_token: config.server.api_token.clone(),
        cron_secret: config.schedule.cron_secret.clone(),
    });
    lifecycle.attach(Arc::new(Mutex::new(api)));
    lifecycle.start().await?;

    terminal::print_banner();
    terminal::print_link(
        "API",
        &format!("http://{}:{}/api", config.server.host, config.server.port),
    );
    terminal::print_status("Vision", config.vision.provider.as_str());
    terminal::print_status(
        "Launcher",
        match config.schedule.launcher {
            LauncherKind::Local => "local",
            LauncherKind::Remote => "remote",
        },
    );
    terminal::print_info("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down funnel-swiper...");
    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}
