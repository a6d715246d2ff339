//! Action Executor: one abstract UI action in, fresh screenshot and URL out.
//!
//! Coordinates travel through the system on a device-independent 0..=999
//! grid and are only turned into pixels here, against the session's real
//! viewport.

pub mod chrome;

pub use chrome::ChromeLauncher;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const GRID_MAX: i32 = 999;
pub const MAX_WAIT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1440,
            height: 900,
        }
    }
}

impl Viewport {
    pub fn new(width: Option<u32>, height: Option<u32>) -> Self {
        let base = Self::default();
        Self {
            width: width.unwrap_or(base.width).clamp(320, 3840),
            height: height.unwrap_or(base.height).clamp(240, 2160),
        }
    }

    /// Maps a grid point to an in-bounds pixel.
    pub fn to_pixels(&self, x: i32, y: i32) -> (u32, u32) {
        (denormalize(x, self.width), denormalize(y, self.height))
    }
}

/// `pixel = round(normalized / 999 * dimension)`, clamped to `0..dimension`.
pub fn denormalize(normalized: i32, dimension: u32) -> u32 {
    if dimension == 0 {
        return 0;
    }
    let n = normalized.clamp(0, GRID_MAX) as f64;
    let px = (n / GRID_MAX as f64 * dimension as f64).round() as u32;
    px.min(dimension - 1)
}

/// The executor's action vocabulary. Click/type coordinates are grid units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserAction {
    Navigate {
        url: String,
    },
    Click {
        x: i32,
        y: i32,
    },
    Type {
        text: String,
        x: i32,
        y: i32,
        #[serde(default)]
        press_enter: bool,
    },
    Scroll {
        dx: i32,
        dy: i32,
    },
    Wait {
        ms: u64,
    },
    GoBack,
}

impl BrowserAction {
    pub fn kind(&self) -> &'static str {
        match self {
            BrowserAction::Navigate { .. } => "navigate",
            BrowserAction::Click { .. } => "click",
            BrowserAction::Type { .. } => "type",
            BrowserAction::Scroll { .. } => "scroll",
            BrowserAction::Wait { .. } => "wait",
            BrowserAction::GoBack => "go_back",
        }
    }

    /// Pulls out-of-grid coordinates back onto the nearest grid edge.
    pub fn clamped(self) -> Self {
        let c = |v: i32| v.clamp(0, GRID_MAX);
        match self {
            BrowserAction::Click { x, y } => BrowserAction::Click { x: c(x), y: c(y) },
            BrowserAction::Type {
                text,
                x,
                y,
                press_enter,
            } => BrowserAction::Type {
                text,
                x: c(x),
                y: c(y),
                press_enter,
            },
            BrowserAction::Wait { ms } => BrowserAction::Wait {
                ms: ms.min(MAX_WAIT_MS),
            },
            other => other,
        }
    }
}

/// Page state captured after an action.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub url: String,
    pub title: Option<String>,
    /// Base64-encoded PNG.
    pub screenshot: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("{action} timed out after {}s", .after.as_secs())]
    Timeout { action: String, after: Duration },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("browser session crashed: {0}")]
    Crashed(String),
    #[error("browser failed to launch: {0}")]
    Launch(String),
}

impl ExecutorError {
    /// Timeouts and navigation blips can be retried within the same step.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::Timeout { .. } | ExecutorError::Navigation(_)
        )
    }
}

/// A live browser session, exclusively owned by one runner.
#[async_trait]
pub trait ActionExecutor: Send {
    fn viewport(&self) -> Viewport;

    async fn perform(&mut self, action: &BrowserAction) -> Result<Observation, ExecutorError>;

    async fn observe(&mut self) -> Result<Observation, ExecutorError>;

    async fn extract_links(&mut self) -> Result<Vec<String>, ExecutorError> {
        Ok(Vec::new())
    }

    /// Releases the session. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn ActionExecutor>, ExecutorError>;
}
