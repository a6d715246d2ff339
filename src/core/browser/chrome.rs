use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, InsertTextParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport as CdpViewport;
use chromiumoxide::layout::Point;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{ActionExecutor, BrowserAction, BrowserLauncher, ExecutorError, Observation, Viewport};

const LINKS_SCRIPT: &str = r"
    Array.from(document.querySelectorAll('a[href]'))
        .map(a => a.href)
        .filter(h => h.startsWith('http'))
        .slice(0, 200)
";

const READY_STATE_SCRIPT: &str = "document.readyState";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Locates a Chrome/Chromium binary. `CHROMIUM_PATH` wins over the well-known locations.
pub fn find_browser_executable() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!(
            "CHROMIUM_PATH points to non-existent file: {}",
            path.display()
        );
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    };

    if let Some(found) = candidates.iter().map(PathBuf::from).find(|p| p.exists()) {
        return Some(found);
    }

    if cfg!(target_os = "windows") {
        return None;
    }
    ["chromium", "chromium-browser", "google-chrome"]
        .iter()
        .find_map(|cmd| {
            let output = Command::new("which").arg(cmd).output().ok()?;
            if !output.status.success() {
                return None;
            }
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!path.is_empty()).then(|| PathBuf::from(path))
        })
}

pub struct ChromeLauncher {
    headless: bool,
    chrome_path: Option<PathBuf>,
    action_timeout: Duration,
    /// Parent of the per-session throwaway profiles.
    profile_root: PathBuf,
}

impl ChromeLauncher {
    pub fn new(headless: bool, chrome_path: Option<PathBuf>, action_timeout: Duration) -> Self {
        Self {
            headless,
            chrome_path,
            action_timeout,
            profile_root: std::env::temp_dir(),
        }
    }

    pub fn with_profile_root(mut self, root: PathBuf) -> Self {
        self.profile_root = root;
        self
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn ActionExecutor>, ExecutorError> {
        let chrome_path = self
            .chrome_path
            .clone()
            .or_else(find_browser_executable)
            .ok_or_else(|| ExecutorError::Launch("Chrome/Chromium executable not found".into()))?;

        let user_data_dir = self
            .profile_root
            .join(format!("funnel-swiper-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&user_data_dir)
            .await
            .map_err(|e| ExecutorError::Launch(format!("user data dir: {e}")))?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(user_data_dir.clone())
            .request_timeout(self.action_timeout)
            .window_size(viewport.width, viewport.height)
            .viewport(CdpViewport {
                width: viewport.width,
                height: viewport.height,
                ..Default::default()
            })
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-notifications")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--hide-scrollbars")
            .arg("--mute-audio");
        builder = if self.headless {
            builder.headless_mode(HeadlessMode::default())
        } else {
            builder.with_head()
        };
        let launched = match builder.build() {
            Ok(config) => Browser::launch(config).await.map_err(|e| e.to_string()),
            Err(e) => Err(format!("browser config: {e}")),
        };
        let (mut browser, mut handler) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                remove_user_data_dir(&user_data_dir).await;
                return Err(ExecutorError::Launch(e));
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    // chromiumoxide cannot decode every CDP event; those are noise.
                    let msg = e.to_string();
                    if msg.contains("did not match any variant") || msg.contains("deserialize") {
                        trace!("Suppressed CDP decode error: {}", msg);
                    } else {
                        debug!("Browser handler error: {}", msg);
                    }
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                shut_down(&mut browser).await;
                handler_task.abort();
                remove_user_data_dir(&user_data_dir).await;
                return Err(ExecutorError::Launch(format!("new page: {e}")));
            }
        };

        info!(
            "Browser session ready ({}x{})",
            viewport.width, viewport.height
        );
        Ok(Box::new(ChromeSession {
            browser,
            page,
            handler_task,
            viewport,
            action_timeout: self.action_timeout,
            user_data_dir,
            closed: false,
        }))
    }
}

/// Asks Chrome to exit, then kills the process if it has not gone within
/// [`SHUTDOWN_GRACE`].
async fn shut_down(browser: &mut Browser) {
    let graceful = tokio::time::timeout(SHUTDOWN_GRACE, async {
        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        browser.wait().await
    })
    .await;
    match graceful {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!("Waiting for browser exit failed: {}", e),
        Err(_) => {
            warn!(
                "Browser did not exit within {}s, killing it",
                SHUTDOWN_GRACE.as_secs()
            );
            if let Some(Err(e)) = browser.kill().await {
                warn!("Could not kill browser process: {}", e);
            }
        }
    }
}

async fn remove_user_data_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        trace!("Could not remove {}: {}", dir.display(), e);
    }
}

pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    viewport: Viewport,
    action_timeout: Duration,
    user_data_dir: PathBuf,
    closed: bool,
}

/// Chrome's network error code (`net::ERR_...`) inside a CDP message, if any.
fn net_error_code(msg: &str) -> Option<&str> {
    let start = msg.find("net::ERR_")?;
    let code = &msg[start..];
    let end = code
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':'))
        .unwrap_or(code.len());
    Some(&code[..end])
}

/// Maps a CDP failure onto the executor's error kinds.
///
/// Only a broken transport to the browser counts as a crash; page-level
/// network failures stay retryable.
fn classify(action: &str, err: CdpError, timeout: Duration) -> ExecutorError {
    let timed_out = || ExecutorError::Timeout {
        action: action.to_string(),
        after: timeout,
    };
    match err {
        CdpError::Timeout => timed_out(),
        CdpError::Ws(_)
        | CdpError::ChannelSendError(_)
        | CdpError::NoResponse
        | CdpError::UnexpectedWsMessage(_) => ExecutorError::Crashed(err.to_string()),
        CdpError::NotFound | CdpError::FrameNotFound(_) => {
            ExecutorError::ElementNotFound(err.to_string())
        }
        other => {
            let msg = other.to_string();
            let net_timed_out = net_error_code(&msg).map(|code| code.ends_with("TIMED_OUT"));
            match net_timed_out {
                Some(true) => timed_out(),
                Some(false) => ExecutorError::Navigation(msg),
                None => {
                    let lower = msg.to_lowercase();
                    if lower.contains("no node") || lower.contains("could not find node") {
                        ExecutorError::ElementNotFound(msg)
                    } else {
                        ExecutorError::Navigation(msg)
                    }
                }
            }
        }
    }
}

impl ChromeSession {
    fn point(&self, x: i32, y: i32) -> Point {
        let (px, py) = self.viewport.to_pixels(x, y);
        Point::new(px as f64, py as f64)
    }

    async fn dispatch(&self, action: &BrowserAction) -> Result<(), ExecutorError> {
        let kind = action.kind();
        let cdp = |e| classify(kind, e, self.action_timeout);
        match action {
            BrowserAction::Navigate { url } => {
                self.page.goto(url.as_str()).await.map_err(cdp)?;
            }
            BrowserAction::Click { x, y } => {
                self.page.click(self.point(*x, *y)).await.map_err(cdp)?;
            }
            BrowserAction::Type {
                text,
                x,
                y,
                press_enter,
            } => {
                self.page.click(self.point(*x, *y)).await.map_err(cdp)?;
                self.page
                    .execute(InsertTextParams::new(text.clone()))
                    .await
                    .map_err(cdp)?;
                if *press_enter {
                    self.press_enter().await?;
                }
            }
            BrowserAction::Scroll { dx, dy } => {
                self.page
                    .evaluate(format!("window.scrollBy({dx}, {dy})"))
                    .await
                    .map_err(cdp)?;
            }
            BrowserAction::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            BrowserAction::GoBack => {
                self.page
                    .evaluate("window.history.back()")
                    .await
                    .map_err(cdp)?;
            }
        }
        Ok(())
    }

    async fn press_enter(&self) -> Result<(), ExecutorError> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let params = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key("Enter")
                .code("Enter")
                .text("\r")
                .windows_virtual_key_code(13)
                .build()
                .map_err(ExecutorError::Navigation)?;
            self.page
                .execute(params)
                .await
                .map_err(|e| classify("type", e, self.action_timeout))?;
        }
        Ok(())
    }

    /// Polls `document.readyState` for a short while after an action.
    async fn settle(&self, max_wait: Duration) {
        let start = Instant::now();
        while start.elapsed() < max_wait {
            match self.page.evaluate(READY_STATE_SCRIPT).await {
                Ok(result) => {
                    if result.into_value::<String>().ok().as_deref() == Some("complete") {
                        break;
                    }
                }
                Err(e) => trace!("readyState probe failed: {}", e),
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    async fn capture(&self) -> Result<Observation, ExecutorError> {
        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            capture_beyond_viewport: Some(false),
            ..Default::default()
        };
        let png = self
            .page
            .screenshot(params)
            .await
            .map_err(|e| classify("screenshot", e, self.action_timeout))?;

        let url = match self.page.url().await {
            Ok(Some(url)) => url,
            Ok(None) => "about:blank".to_string(),
            Err(e) => return Err(classify("url", e, self.action_timeout)),
        };
        let title = self.page.get_title().await.ok().flatten();

        Ok(Observation {
            url,
            title,
            screenshot: base64::engine::general_purpose::STANDARD.encode(png),
        })
    }
}

#[async_trait]
impl ActionExecutor for ChromeSession {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn perform(&mut self, action: &BrowserAction) -> Result<Observation, ExecutorError> {
        if self.closed {
            return Err(ExecutorError::Crashed("session already closed".into()));
        }
        let timeout = self.action_timeout;
        tokio::time::timeout(timeout, self.dispatch(action))
            .await
            .map_err(|_| ExecutorError::Timeout {
                action: action.kind().to_string(),
                after: timeout,
            })??;
        self.settle(Duration::from_secs(5)).await;
        self.observe().await
    }

    async fn observe(&mut self) -> Result<Observation, ExecutorError> {
        let timeout = self.action_timeout;
        tokio::time::timeout(timeout, self.capture())
            .await
            .map_err(|_| ExecutorError::Timeout {
                action: "screenshot".to_string(),
                after: timeout,
            })?
    }

    async fn extract_links(&mut self) -> Result<Vec<String>, ExecutorError> {
        let result = self
            .page
            .evaluate(LINKS_SCRIPT)
            .await
            .map_err(|e| classify("extract_links", e, self.action_timeout))?;
        Ok(result.into_value::<Vec<String>>().unwrap_or_default())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        shut_down(&mut self.browser).await;
        self.handler_task.abort();
        remove_user_data_dir(&self.user_data_dir).await;
        info!("Browser session closed");
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}
