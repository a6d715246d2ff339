use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use super::can_transition;
use super::types::{Job, JobId, JobOutcome, JobParams, JobPatch};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-process arena of job records.
///
/// Records live only as long as the process; there is no durability across
/// restarts. Every mutation is re-broadcast as a full snapshot so push
/// subscribers see the same state a poller would.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    events: broadcast::Sender<Job>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Inserts a fresh `pending` record and returns its id. Never waits on the run.
    pub async fn create(&self, params: JobParams) -> JobId {
        let id = JobId::generate();
        let job = Job::new(id.clone(), params);
        self.jobs.write().await.insert(id.clone(), job.clone());
        debug!(job_id = %id, "job created");
        let _ = self.events.send(job);
        id
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Snapshots of every record, newest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Merges `patch` into the record. Unknown ids are ignored and return `false`.
    ///
    /// Status writes that would regress (or leave a terminal state) are dropped,
    /// and `current_step` never decreases or passes `total_steps`.
    pub async fn update(&self, id: &JobId, patch: JobPatch) -> bool {
        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(id) else {
                debug!(job_id = %id, "update for unknown job ignored");
                return false;
            };
            if job.status.is_terminal() {
                debug!(job_id = %id, status = job.status.as_str(), "update after terminal state ignored");
                return false;
            }

            if let Some(status) = patch.status {
                if status.is_terminal() {
                    warn!(job_id = %id, "terminal status must go through finish(); ignored");
                } else if can_transition(job.status, status) {
                    job.status = status;
                } else {
                    warn!(
                        job_id = %id,
                        "rejected status transition {} -> {}",
                        job.status.as_str(),
                        status.as_str()
                    );
                }
            }
            if let Some(step) = patch.current_step {
                job.current_step = job.current_step.max(step.min(job.total_steps));
            }
            if let Some(result) = patch.result {
                job.result = Some(result);
            }
            if let Some(error) = patch.error {
                job.error = Some(error);
            }
            job.updated_at = Utc::now();
            job.clone()
        };
        let _ = self.events.send(snapshot);
        true
    }

    /// Performs the single terminal write for a job.
    ///
    /// Returns `false` when the id is unknown or the job already reached a
    /// terminal state; the first outcome always wins.
    pub async fn finish(&self, id: &JobId, outcome: JobOutcome) -> bool {
        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(id) else {
                debug!(job_id = %id, "finish for unknown job ignored");
                return false;
            };
            let to = outcome.status();
            if !can_transition(job.status, to) {
                warn!(
                    job_id = %id,
                    "dropping terminal write {} -> {}",
                    job.status.as_str(),
                    to.as_str()
                );
                return false;
            }

            job.status = to;
            match outcome {
                JobOutcome::Completed(result)
                | JobOutcome::MaxTurnsReached(result)
                | JobOutcome::Blocked(result) => {
                    job.current_step = job
                        .current_step
                        .max(result.steps.len() as u32)
                        .min(job.total_steps);
                    job.result = Some(result);
                    job.error = None;
                }
                JobOutcome::Failed(error) => {
                    job.result = None;
                    job.error = Some(error);
                }
            }
            let now = Utc::now();
            job.updated_at = now;
            job.finished_at = Some(now);
            job.clone()
        };
        let _ = self.events.send(snapshot);
        true
    }

    /// Drops terminal records that finished before `cutoff`. Running jobs are never evicted.
    pub async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished_at {
            Some(finished) if job.status.is_terminal() => finished >= cutoff,
            _ => true,
        });
        before - jobs.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.events.subscribe()
    }
}
