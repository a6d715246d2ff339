use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info};

use super::LifecycleManager;
use crate::core::jobs::JobRegistry;
use crate::core::schedule::{RunLauncher, ScheduleStore, dispatch};

/// Every five minutes, drops finished jobs older than `ttl`.
pub async fn schedule_registry_eviction(
    lifecycle: &LifecycleManager,
    registry: JobRegistry,
    ttl: chrono::Duration,
) -> Result<()> {
    let job = tokio_cron_scheduler::Job::new_async("0 0/5 * * * *", move |_uuid, mut _l| {
        let registry = registry.clone();
        Box::pin(async move {
            let evicted = registry.evict_finished_before(Utc::now() - ttl).await;
            if evicted > 0 {
                info!("Evicted {} finished job(s) from the registry", evicted);
            } else {
                debug!("Registry eviction: nothing to do");
            }
        })
    })?;
    lifecycle.scheduler.add(job).await?;
    Ok(())
}

/// Fires the dispatcher in-process on `expr`, for deployments without an external cron.
pub async fn schedule_dispatch(
    lifecycle: &LifecycleManager,
    expr: &str,
    store: Arc<dyn ScheduleStore>,
    launcher: Arc<dyn RunLauncher>,
) -> Result<()> {
    let job = tokio_cron_scheduler::Job::new_async(expr, move |_uuid, mut _l| {
        let store = store.clone();
        let launcher = launcher.clone();
        Box::pin(async move {
            if let Err(e) = dispatch(store.as_ref(), launcher.as_ref(), Utc::now()).await {
                error!("Scheduled dispatch failed: {:#}", e);
            }
        })
    })?;
    lifecycle.scheduler.add(job).await?;
    info!("In-process dispatcher scheduled ({})", expr);
    Ok(())
}
