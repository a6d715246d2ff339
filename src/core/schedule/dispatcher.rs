use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{RunLauncher, RunOutcome, RunRecord, ScheduleStore, ScheduledJob};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub jobs_checked: usize,
    pub jobs_started: usize,
    pub jobs_errored: usize,
}

/// One pass over the due templates.
///
/// Every processed template gets exactly one recorded outcome and a later
/// `next_run_at`, whether or not its run could be started. Launches run
/// concurrently and each template is recorded as soon as its own launch
/// returns. Only a failure to read the due set is returned as an error. No
/// lock is taken, so two overlapping passes can both start a template whose
/// launch is still in flight.
pub async fn dispatch(
    store: &dyn ScheduleStore,
    launcher: &dyn RunLauncher,
    now: DateTime<Utc>,
) -> Result<DispatchSummary> {
    let due = store
        .fetch_due(now)
        .await
        .context("fetching due scheduled jobs")?;
    let mut summary = DispatchSummary {
        jobs_checked: due.len(),
        ..Default::default()
    };

    let started = join_all(due.iter().map(|job| start_one(store, launcher, job, now))).await;
    for started in started {
        if started {
            summary.jobs_started += 1;
        } else {
            summary.jobs_errored += 1;
        }
    }

    info!(
        checked = summary.jobs_checked,
        started = summary.jobs_started,
        errored = summary.jobs_errored,
        "dispatch pass finished"
    );
    Ok(summary)
}

/// Launches one template and records the outcome. Returns whether it counts as started.
async fn start_one(
    store: &dyn ScheduleStore,
    launcher: &dyn RunLauncher,
    job: &ScheduledJob,
    now: DateTime<Utc>,
) -> bool {
    let next_run_at = job.frequency.next_run_after(now);
    let outcome = match launcher.launch(job).await {
        Ok(job_id) => {
            info!(schedule_id = %job.id, job_id = %job_id, "scheduled run started");
            RunOutcome::Started { job_id }
        }
        Err(e) => {
            warn!(schedule_id = %job.id, "scheduled run failed to start: {:#}", e);
            RunOutcome::Failed {
                error: format!("{e:#}"),
            }
        }
    };
    let started = matches!(outcome, RunOutcome::Started { .. });

    let record = RunRecord {
        ran_at: now,
        next_run_at,
        outcome,
    };
    match store.record_run(&job.id, record).await {
        Ok(true) => started,
        Ok(false) => {
            warn!(schedule_id = %job.id, "scheduled job deleted during dispatch");
            false
        }
        Err(e) => {
            error!(schedule_id = %job.id, "could not record scheduled run: {:#}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::core::schedule::{
        Frequency, LastRunStatus, NewScheduledJob, ScheduleUpdate, SqliteScheduleStore,
    };

    /// Starts everything except templates whose title contains "broken".
    struct RecordingLauncher {
        launched: Mutex<Vec<String>>,
    }

    impl RecordingLauncher {
        fn new() -> Self {
            Self {
                launched: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RunLauncher for RecordingLauncher {
        async fn launch(&self, job: &ScheduledJob) -> Result<String> {
            if job.title.contains("broken") {
                bail!("remote pipeline returned 502");
            }
            let mut launched = self.launched.lock().unwrap();
            launched.push(job.id.clone());
            Ok(format!("run-{}", launched.len()))
        }
    }

    struct UnreachableStore;

    #[async_trait]
    impl ScheduleStore for UnreachableStore {
        async fn fetch_due(&self, _now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
            bail!("connection refused")
        }
        async fn list(&self) -> Result<Vec<ScheduledJob>> {
            bail!("connection refused")
        }
        async fn get(&self, _id: &str) -> Result<Option<ScheduledJob>> {
            bail!("connection refused")
        }
        async fn create(&self, _new: NewScheduledJob, _now: DateTime<Utc>) -> Result<ScheduledJob> {
            bail!("connection refused")
        }
        async fn update(
            &self,
            _id: &str,
            _fields: ScheduleUpdate,
            _now: DateTime<Utc>,
        ) -> Result<Option<ScheduledJob>> {
            bail!("connection refused")
        }
        async fn record_run(&self, _id: &str, _record: RunRecord) -> Result<bool> {
            bail!("connection refused")
        }
        async fn delete(&self, _id: &str) -> Result<bool> {
            bail!("connection refused")
        }
    }

    fn template(title: &str) -> NewScheduledJob {
        NewScheduledJob {
            title: title.to_string(),
            prompt: None,
            start_url: "https://funnel.example".to_string(),
            max_turns: Some(30),
            frequency: Frequency::Every6Hours,
            is_active: Some(true),
        }
    }

    #[tokio::test]
    async fn every_due_job_advances_whether_or_not_it_started() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let created_at = Utc::now() - Duration::days(1);
        let ok = store.create(template("healthy"), created_at).await.unwrap();
        let bad = store.create(template("broken"), created_at).await.unwrap();
        let launcher = RecordingLauncher::new();
        let now = Utc::now();

        let summary = dispatch(&store, &launcher, now).await.unwrap();

        assert_eq!(
            summary,
            DispatchSummary {
                jobs_checked: 2,
                jobs_started: 1,
                jobs_errored: 1
            }
        );

        let ok_after = store.get(&ok.id).await.unwrap().unwrap();
        assert!(ok_after.next_run_at > ok.next_run_at);
        assert!(ok_after.next_run_at > now);
        assert_eq!(ok_after.last_status, Some(LastRunStatus::Running));
        assert_eq!(ok_after.last_job_id.as_deref(), Some("run-1"));
        assert_eq!(ok_after.total_runs, 1);

        let bad_after = store.get(&bad.id).await.unwrap().unwrap();
        assert!(bad_after.next_run_at > bad.next_run_at);
        assert_eq!(bad_after.last_status, Some(LastRunStatus::Error));
        assert!(bad_after.last_error.unwrap().contains("502"));
        assert!(bad_after.last_job_id.is_none());
        assert_eq!(bad_after.total_runs, 1);
    }

    #[tokio::test]
    async fn a_second_pass_finds_nothing_due() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        store
            .create(template("healthy"), Utc::now() - Duration::days(1))
            .await
            .unwrap();
        let launcher = RecordingLauncher::new();
        let now = Utc::now();

        dispatch(&store, &launcher, now).await.unwrap();
        let second = dispatch(&store, &launcher, now).await.unwrap();

        assert_eq!(second, DispatchSummary::default());
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }

    /// Each launch waits until every other due template has started launching too.
    struct RendezvousLauncher {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl RunLauncher for RendezvousLauncher {
        async fn launch(&self, job: &ScheduledJob) -> Result<String> {
            self.barrier.wait().await;
            Ok(format!("run-for-{}", job.id))
        }
    }

    #[tokio::test]
    async fn slow_launches_do_not_hold_back_the_rest_of_the_pass() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let created_at = Utc::now() - Duration::days(1);
        for title in ["landing", "checkout", "upsell"] {
            store.create(template(title), created_at).await.unwrap();
        }
        let launcher = RendezvousLauncher {
            barrier: tokio::sync::Barrier::new(3),
        };
        let now = Utc::now();

        let summary = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            dispatch(&store, &launcher, now),
        )
        .await
        .expect("launches should overlap")
        .unwrap();

        assert_eq!(summary.jobs_started, 3);
        for job in store.list().await.unwrap() {
            assert!(job.next_run_at > now);
            assert_eq!(job.last_job_id, Some(format!("run-for-{}", job.id)));
        }
    }

    #[tokio::test]
    async fn unreachable_store_is_a_systemic_error() {
        let launcher = RecordingLauncher::new();
        let err = dispatch(&UnreachableStore, &launcher, Utc::now())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
    }
}
