use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::browser::{BrowserAction, Viewport};

pub const DEFAULT_MAX_STEPS: u32 = 100;
pub const MIN_MAX_STEPS: u32 = 3;
pub const MAX_MAX_STEPS: u32 = 100;

/// Opaque handle into the job registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    MaxTurnsReached,
    Blocked,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::MaxTurnsReached => "max_turns_reached",
            JobStatus::Blocked => "blocked",
            JobStatus::Failed => "failed",
        }
    }

    #[cfg(test)]
    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "max_turns_reached" => Some(JobStatus::MaxTurnsReached),
            "blocked" => Some(JobStatus::Blocked),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::MaxTurnsReached
                | JobStatus::Blocked
                | JobStatus::Failed
        )
    }

    /// Terminal states that carry a `result` rather than an `error`.
    pub fn is_success_terminal(self) -> bool {
        self.is_terminal() && self != JobStatus::Failed
    }
}

/// Immutable input configuration of a job, fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    pub entry_url: String,
    pub max_steps: u32,
    pub viewport: Viewport,
    /// Free-text task for agentic runs. `None` means a plain funnel crawl.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default = "default_true")]
    pub capture_screenshots: bool,
    #[serde(default)]
    pub extract_links: bool,
}

fn default_true() -> bool {
    true
}

impl JobParams {
    pub fn new(entry_url: impl Into<String>) -> Self {
        Self {
            entry_url: entry_url.into(),
            max_steps: DEFAULT_MAX_STEPS,
            viewport: Viewport::default(),
            prompt: None,
            capture_screenshots: true,
            extract_links: false,
        }
    }
}

pub fn clamp_max_steps(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(DEFAULT_MAX_STEPS)
        .clamp(MIN_MAX_STEPS, MAX_MAX_STEPS)
}

/// One iteration of the loop: the action taken and what the page looked like afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub index: u32,
    pub url: String,
    pub action: BrowserAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub params: JobParams,
    pub current_step: u32,
    pub total_steps: u32,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(id: JobId, params: JobParams) -> Self {
        let now = Utc::now();
        let total_steps = params.max_steps;
        Self {
            id,
            status: JobStatus::Pending,
            params,
            current_step: 0,
            total_steps,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Partial update merged into a registry record.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub current_step: Option<u32>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(current_step: u32, result: JobResult) -> Self {
        Self {
            current_step: Some(current_step),
            result: Some(result),
            ..Self::default()
        }
    }
}

/// How a run ended. Written to the registry exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(JobResult),
    MaxTurnsReached(JobResult),
    Blocked(JobResult),
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::MaxTurnsReached(_) => JobStatus::MaxTurnsReached,
            JobOutcome::Blocked(_) => JobStatus::Blocked,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}
