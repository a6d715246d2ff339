//! Crawl/agent runner: drives one job from `pending` to a terminal state.
//!
//! Each job gets its own detached task that exclusively owns the job's
//! browser session. The task observes, asks the vision client for one
//! decision, executes it, and publishes progress to the registry after every
//! step. The session is closed exactly once on every exit path, and the
//! registry receives exactly one terminal write.

mod history;
mod retry;

#[cfg(test)]
pub(crate) mod tests;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

pub use history::{ConversationHistory, Exchange};
pub use retry::RetryPolicy;

use crate::core::browser::{
    ActionExecutor, BrowserAction, BrowserLauncher, ExecutorError, Observation,
};
use crate::core::config::RunnerConfig;
use crate::core::jobs::{
    JobId, JobOutcome, JobParams, JobPatch, JobRegistry, JobResult, JobStatus, Step,
    clamp_max_steps,
};
use crate::core::vision::{Decision, DecisionRequest, VisionClient, VisionError, build_instruction};

/// Shared entry point for starting jobs; cheap to clone behind an `Arc`.
pub struct JobRunner {
    registry: JobRegistry,
    launcher: Arc<dyn BrowserLauncher>,
    vision: Arc<dyn VisionClient>,
    retry: RetryPolicy,
    history_window: usize,
    wall_clock: Duration,
    close_timeout: Duration,
    default_max_steps: u32,
}

impl JobRunner {
    pub fn new(
        registry: JobRegistry,
        launcher: Arc<dyn BrowserLauncher>,
        vision: Arc<dyn VisionClient>,
        config: &RunnerConfig,
    ) -> Self {
        Self {
            registry,
            launcher,
            vision,
            retry: RetryPolicy::from_config(config),
            history_window: config.history_window,
            wall_clock: Duration::from_secs(config.wall_clock_secs),
            close_timeout: Duration::from_secs(config.session_close_secs),
            default_max_steps: clamp_max_steps(Some(config.default_max_steps)),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Step ceiling for requests that do not name one.
    pub fn default_max_steps(&self) -> u32 {
        self.default_max_steps
    }

    /// Launches a browser, allocates the job and detaches its run.
    ///
    /// A launch failure is systemic: it is returned before any job id exists.
    pub async fn start(self: &Arc<Self>, params: JobParams) -> Result<JobId, ExecutorError> {
        let executor = self.launcher.launch(params.viewport).await?;
        let id = self.registry.create(params.clone()).await;
        info!(
            job_id = %id,
            entry_url = %params.entry_url,
            max_steps = params.max_steps,
            "job accepted"
        );
        self.spawn(id.clone(), params, executor);
        Ok(id)
    }

    fn spawn(self: &Arc<Self>, id: JobId, params: JobParams, executor: Box<dyn ActionExecutor>) {
        let runner = Arc::clone(self);
        let run_id = id.clone();
        let handle = tokio::spawn(async move { runner.run(run_id, params, executor).await });

        // Anything that escapes the run (a panic while closing the session,
        // runtime shutdown) still has to reach the record.
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "runner task was cancelled".to_string()
                };
                error!(job_id = %id, "runner task died: {}", reason);
                registry
                    .finish(&id, JobOutcome::Failed(format!("internal error: {reason}")))
                    .await;
            }
        });
    }

    /// Runs a job to completion on the current task.
    pub async fn run(
        &self,
        id: JobId,
        params: JobParams,
        mut executor: Box<dyn ActionExecutor>,
    ) -> JobOutcome {
        self.registry
            .update(&id, JobPatch::status(JobStatus::Running))
            .await;

        let driven = AssertUnwindSafe(tokio::time::timeout(
            self.wall_clock,
            self.drive(&id, &params, executor.as_mut()),
        ))
        .catch_unwind()
        .await;

        let outcome = match driven {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => JobOutcome::Failed(format!(
                "job exceeded its time budget of {}s",
                self.wall_clock.as_secs()
            )),
            Err(panic) => JobOutcome::Failed(format!(
                "internal error: {}",
                panic_message(panic)
            )),
        };

        // Teardown sits outside the wall-clock budget, so it gets its own.
        if tokio::time::timeout(self.close_timeout, executor.close())
            .await
            .is_err()
        {
            warn!(
                job_id = %id,
                "browser session did not close within {}s, abandoning it",
                self.close_timeout.as_secs()
            );
        }

        match &outcome {
            JobOutcome::Failed(reason) => warn!(job_id = %id, "job failed: {}", reason),
            other => info!(job_id = %id, status = other.status().as_str(), "job finished"),
        }
        self.registry.finish(&id, outcome.clone()).await;
        outcome
    }

    async fn drive(
        &self,
        id: &JobId,
        params: &JobParams,
        executor: &mut dyn ActionExecutor,
    ) -> JobOutcome {
        let viewport = executor.viewport();
        let max_steps = params.max_steps;
        let mut history = ConversationHistory::new(build_instruction(params), self.history_window);
        let mut result = JobResult::default();

        let entry = BrowserAction::Navigate {
            url: params.entry_url.clone(),
        };
        let mut observation = match self.perform(id, executor, &entry).await {
            Ok(observation) => observation,
            Err(e) => {
                return JobOutcome::Failed(format!("could not open {}: {e}", params.entry_url));
            }
        };
        result.final_url = Some(observation.url.clone());

        let mut step: u32 = 0;
        loop {
            let at_ceiling = step >= max_steps;
            history.trim();
            let request = DecisionRequest {
                history: &history,
                observation: &observation,
                viewport,
                step,
                max_steps,
            };

            let decision = match self.decide(id, request).await {
                Ok(decision) => decision,
                Err(e) if at_ceiling => {
                    debug!(job_id = %id, "final decision failed at step ceiling: {}", e);
                    return JobOutcome::MaxTurnsReached(result);
                }
                Err(e) => return JobOutcome::Failed(e),
            };

            let (action, reasoning) = match decision {
                Decision::Done { summary } => {
                    result.summary = summary;
                    return JobOutcome::Completed(result);
                }
                Decision::Blocked { reason } => {
                    let reason = if reason.trim().is_empty() {
                        "page blocked further progress".to_string()
                    } else {
                        reason
                    };
                    info!(job_id = %id, step, "job blocked: {}", reason);
                    result.blocked_reason = Some(reason);
                    return JobOutcome::Blocked(result);
                }
                Decision::Act { .. } if at_ceiling => {
                    return JobOutcome::MaxTurnsReached(result);
                }
                Decision::Act { action, reasoning } => (action.clamped(), reasoning),
            };

            let after = match self.perform(id, executor, &action).await {
                Ok(after) => after,
                Err(e) => {
                    return JobOutcome::Failed(format!(
                        "step {} ({}) failed: {e}",
                        step + 1,
                        action.kind()
                    ));
                }
            };
            step += 1;

            let links = if params.extract_links {
                executor.extract_links().await.unwrap_or_else(|e| {
                    warn!(job_id = %id, step, "link extraction failed: {}", e);
                    Vec::new()
                })
            } else {
                Vec::new()
            };

            result.steps.push(Step {
                index: step,
                url: after.url.clone(),
                action: action.clone(),
                reasoning: reasoning.clone(),
                title: after.title.clone(),
                screenshot: params
                    .capture_screenshots
                    .then(|| after.screenshot.clone()),
                links,
                taken_at: Utc::now(),
            });
            result.final_url = Some(after.url.clone());

            let before = std::mem::replace(&mut observation, after);
            history.push(Exchange {
                url: before.url,
                screenshot: Some(before.screenshot),
                action,
                reasoning,
                outcome: format!("ok, page is now {}", observation.url),
            });

            debug!(job_id = %id, step, url = %observation.url, "step recorded");
            if !self
                .registry
                .update(id, JobPatch::progress(step, result.clone()))
                .await
            {
                return JobOutcome::Failed("job record is no longer writable".to_string());
            }
        }
    }

    /// Executes one action, retrying transient failures. Crashes are never retried.
    async fn perform(
        &self,
        id: &JobId,
        executor: &mut dyn ActionExecutor,
        action: &BrowserAction,
    ) -> Result<Observation, ExecutorError> {
        let mut attempt = 1;
        loop {
            match executor.perform(action).await {
                Ok(observation) => return Ok(observation),
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        job_id = %id,
                        attempt,
                        "{} failed, retrying in {}ms: {}",
                        action.kind(),
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Asks for one decision. Transient provider errors use the retry budget;
    /// an unparsable reply gets exactly one more chance, and only two parse
    /// failures back to back end the job.
    async fn decide(&self, id: &JobId, request: DecisionRequest<'_>) -> Result<Decision, String> {
        let mut attempt = 1;
        let mut parse_failures = 0;
        loop {
            match self.vision.decide(request).await {
                Ok(decision) => return Ok(decision),
                Err(e) if e.is_parse() && parse_failures == 0 => {
                    parse_failures += 1;
                    warn!(job_id = %id, "vision reply unparsable, asking again: {}", e);
                }
                Err(e) if e.is_parse() => {
                    return Err(format!("vision reply unparsable twice in a row: {e}"));
                }
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    parse_failures = 0;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        job_id = %id,
                        attempt,
                        "vision call failed, retrying in {}ms: {}",
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(describe_vision_failure(&e, attempt)),
            }
        }
    }
}

fn describe_vision_failure(err: &VisionError, attempts: u32) -> String {
    if err.is_retryable() {
        format!("{err} (gave up after {attempts} attempts)")
    } else {
        err.to_string()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "runner panicked".to_string()
    }
}
