
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::browser::{
    ActionExecutor, BrowserAction, BrowserLauncher, ExecutorError, Observation, Viewport,
};
use crate::core::config::RunnerConfig;
use crate::core::jobs::{Job, JobId, JobRegistry};
use crate::core::runner::JobRunner;
use crate::core::vision::{Decision, DecisionRequest, VisionClient, VisionError};

/// What a test can observe about the fake browser after the run.
#[derive(Clone, Default)]
pub(crate) struct ExecutorProbe {
    pub performed: Arc<Mutex<Vec<BrowserAction>>>,
    pub closes: Arc<AtomicUsize>,
}

impl ExecutorProbe {
    pub fn performed(&self) -> Vec<BrowserAction> {
        self.performed.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeExecutor {
    probe: ExecutorProbe,
    viewport: Viewport,
    url: String,
    calls: usize,
    /// Errors keyed by 1-based `perform` call number.
    failures: HashMap<usize, ExecutorError>,
    panic_on_close: bool,
    hang_on_close: bool,
}

impl FakeExecutor {
    pub fn new() -> (Self, ExecutorProbe) {
        let probe = ExecutorProbe::default();
        (
            Self {
                probe: probe.clone(),
                viewport: Viewport::default(),
                url: "about:blank".to_string(),
                calls: 0,
                failures: HashMap::new(),
                panic_on_close: false,
                hang_on_close: false,
            },
            probe,
        )
    }

    pub fn failing_on(mut self, call: usize, error: ExecutorError) -> Self {
        self.failures.insert(call, error);
        self
    }

    pub fn panicking_on_close(mut self) -> Self {
        self.panic_on_close = true;
        self
    }

    pub fn hanging_on_close(mut self) -> Self {
        self.hang_on_close = true;
        self
    }

    fn snapshot(&self) -> Observation {
        Observation {
            url: self.url.clone(),
            title: Some(format!("Page {}", self.calls)),
            screenshot: "c2NyZWVu".to_string(),
        }
    }
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn perform(&mut self, action: &BrowserAction) -> Result<Observation, ExecutorError> {
        self.calls += 1;
        if let Some(error) = self.failures.remove(&self.calls) {
            return Err(error);
        }
        self.probe.performed.lock().unwrap().push(action.clone());
        if let BrowserAction::Navigate { url } = action {
            self.url = url.clone();
        }
        Ok(self.snapshot())
    }

    async fn observe(&mut self) -> Result<Observation, ExecutorError> {
        Ok(self.snapshot())
    }

    async fn extract_links(&mut self) -> Result<Vec<String>, ExecutorError> {
        Ok(vec![format!("{}/next", self.url)])
    }

    async fn close(&mut self) {
        if self.panic_on_close {
            panic!("close exploded");
        }
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one pre-built executor, or refuses to launch.
pub(crate) struct FakeLauncher {
    executor: Mutex<Option<FakeExecutor>>,
}

impl FakeLauncher {
    pub fn with(executor: FakeExecutor) -> Arc<Self> {
        Arc::new(Self {
            executor: Mutex::new(Some(executor)),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            executor: Mutex::new(None),
        })
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, _viewport: Viewport) -> Result<Box<dyn ActionExecutor>, ExecutorError> {
        match self.executor.lock().unwrap().take() {
            Some(executor) => Ok(Box::new(executor)),
            None => Err(ExecutorError::Launch("no chrome here".to_string())),
        }
    }
}

/// Replays queued replies, then repeats `fallback` forever.
pub(crate) struct ScriptedVision {
    replies: Mutex<VecDeque<Result<Decision, VisionError>>>,
    fallback: Decision,
    calls: AtomicUsize,
    pub history_lens: Mutex<Vec<usize>>,
    pub instructions: Mutex<Vec<String>>,
}

impl ScriptedVision {
    pub fn new(
        replies: Vec<Result<Decision, VisionError>>,
        fallback: Decision,
    ) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback,
            calls: AtomicUsize::new(0),
            history_lens: Mutex::new(Vec::new()),
            instructions: Mutex::new(Vec::new()),
        })
    }

    pub fn always(decision: Decision) -> Arc<Self> {
        Self::new(Vec::new(), decision)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionClient for ScriptedVision {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history_lens
            .lock()
            .unwrap()
            .push(request.history.len());
        self.instructions
            .lock()
            .unwrap()
            .push(request.history.instruction().to_string());
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

pub(crate) struct PanickingVision;

#[async_trait]
impl VisionClient for PanickingVision {
    async fn decide(&self, _request: DecisionRequest<'_>) -> Result<Decision, VisionError> {
        panic!("boom");
    }
}

pub(crate) struct SlowVision;

#[async_trait]
impl VisionClient for SlowVision {
    async fn decide(&self, _request: DecisionRequest<'_>) -> Result<Decision, VisionError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Decision::Done { summary: None })
    }
}

pub(crate) fn test_config() -> RunnerConfig {
    RunnerConfig {
        retry_base_ms: 0,
        history_window: 3,
        ..RunnerConfig::default()
    }
}

pub(crate) fn runner_with(
    launcher: Arc<dyn BrowserLauncher>,
    vision: Arc<dyn VisionClient>,
    config: &RunnerConfig,
) -> Arc<JobRunner> {
    Arc::new(JobRunner::new(JobRegistry::new(), launcher, vision, config))
}

pub(crate) fn scroll() -> Decision {
    Decision::Act {
        action: BrowserAction::Scroll { dx: 0, dy: 600 },
        reasoning: Some("see more of the page".to_string()),
    }
}

pub(crate) fn done(summary: &str) -> Decision {
    Decision::Done {
        summary: Some(summary.to_string()),
    }
}

/// Polls the registry the way an HTTP client would.
pub(crate) async fn poll_until_terminal(registry: &JobRegistry, id: &JobId) -> Job {
    for _ in 0..500 {
        if let Some(job) = registry.get(id).await
            && job.status.is_terminal()
        {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached a terminal state");
}
