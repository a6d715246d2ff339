//! Recurring job templates and the dispatcher that turns due ones into runs.

mod dispatcher;
mod launcher;
mod store;

pub use dispatcher::{DispatchSummary, dispatch};
pub use launcher::{LocalLauncher, RemoteLauncher, RunLauncher};
pub use store::{ScheduleStore, SqliteScheduleStore};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::jobs::{JobParams, clamp_max_steps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "every_6_hours")]
    Every6Hours,
    #[serde(rename = "every_12_hours")]
    Every12Hours,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Every6Hours => "every_6_hours",
            Frequency::Every12Hours => "every_12_hours",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        }
    }

    pub fn from_frequency(value: &str) -> Option<Self> {
        match value {
            "hourly" => Some(Frequency::Hourly),
            "every_6_hours" => Some(Frequency::Every6Hours),
            "every_12_hours" => Some(Frequency::Every12Hours),
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            _ => None,
        }
    }

    pub fn interval(self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(1),
            Frequency::Every6Hours => Duration::hours(6),
            Frequency::Every12Hours => Duration::hours(12),
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
        }
    }

    /// Next run counted from the moment of the last attempt, so a slow or
    /// failing run never leaves `next_run_at` in the past.
    pub fn next_run_after(self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + self.interval()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRunStatus {
    Running,
    Error,
}

impl LastRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LastRunStatus::Running => "running",
            LastRunStatus::Error => "error",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(LastRunStatus::Running),
            "error" => Some(LastRunStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub title: String,
    pub prompt: Option<String>,
    pub start_url: String,
    pub max_turns: u32,
    pub frequency: Frequency,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<String>,
    pub last_status: Option<LastRunStatus>,
    pub last_error: Option<String>,
    pub total_runs: u64,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Parameters for one run of this template.
    pub fn job_params(&self) -> JobParams {
        JobParams {
            max_steps: clamp_max_steps(Some(self.max_turns)),
            prompt: self.prompt.clone().filter(|p| !p.trim().is_empty()),
            ..JobParams::new(self.start_url.clone())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewScheduledJob {
    pub title: String,
    #[serde(default)]
    pub prompt: Option<String>,
    pub start_url: String,
    #[serde(default)]
    pub max_turns: Option<u32>,
    pub frequency: Frequency,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// User-editable fields. Changing `frequency` recomputes `next_run_at`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    pub title: Option<String>,
    pub prompt: Option<String>,
    pub start_url: Option<String>,
    pub max_turns: Option<u32>,
    pub frequency: Option<Frequency>,
    pub is_active: Option<bool>,
}

impl ScheduleUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.prompt.is_none()
            && self.start_url.is_none()
            && self.max_turns.is_none()
            && self.frequency.is_none()
            && self.is_active.is_none()
    }
}

/// What one dispatcher attempt produced for a template.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Started { job_id: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub ran_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}
