use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use console::style;

use super::serve::{build_run_launcher, build_runner, open_store};
use crate::core::config::{AppConfig, LauncherKind};
use crate::core::jobs::JobRegistry;
use crate::core::schedule::dispatch;
use crate::core::terminal;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One dispatcher pass from the command line.
///
/// Runs started by a local launcher live in this process, so the command
/// stays until every one of them has reached a terminal state.
pub(super) async fn run_dispatch(config: AppConfig) -> Result<()> {
    let store = open_store(&config)?;
    let runner = match config.schedule.launcher {
        LauncherKind::Local => Some(build_runner(&config)?),
        LauncherKind::Remote => None,
    };
    let launcher = build_run_launcher(&config.schedule, runner.clone())?;

    let summary = dispatch(store.as_ref(), launcher.as_ref(), Utc::now()).await?;
    terminal::print_success("Dispatch pass finished");
    terminal::print_dispatch_summary(&summary);
    if summary.jobs_errored > 0 {
        terminal::print_warn("Some scheduled jobs failed to start; see lastError on each.");
    }

    if let Some(runner) = runner
        && summary.jobs_started > 0
    {
        terminal::print_info("Waiting for local runs to finish...");
        wait_for_local_runs(runner.registry()).await;
    }
    Ok(())
}

async fn wait_for_local_runs(registry: &JobRegistry) {
    loop {
        let jobs = registry.list().await;
        if jobs.iter().all(|job| job.status.is_terminal()) {
            for job in jobs {
                let status = if job.status.is_success_terminal() {
                    style(job.status.as_str()).green()
                } else {
                    style(job.status.as_str()).red()
                };
                let detail = job.error.unwrap_or_else(|| job.params.entry_url.clone());
                println!("    {} {} {}", style(job.id.as_str()).dim(), status, detail);
            }
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
