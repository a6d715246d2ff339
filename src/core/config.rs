use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::jobs::DEFAULT_MAX_STEPS;
use crate::core::vision::ProviderType;

pub const CONFIG_FILE_NAME: &str = "funnel-swiper.toml";

/// Root of everything the service writes to disk.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FUNNEL_SWIPER_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("funnel-swiper"))
        .unwrap_or_else(|| PathBuf::from(".funnel-swiper"))
}

pub fn default_config_path() -> PathBuf {
    match std::env::var("FUNNEL_SWIPER_CONFIG") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => data_dir().join(CONFIG_FILE_NAME),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on the job and schedule APIs. Without one, only
    /// loopback binds are served.
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_steps")]
    pub default_max_steps: u32,
    /// Most recent exchanges replayed to the vision model.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_wall_clock")]
    pub wall_clock_secs: u64,
    #[serde(default = "default_session_close")]
    pub session_close_secs: u64,
    /// How long finished jobs stay pollable.
    #[serde(default = "default_job_ttl")]
    pub job_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderType,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_vision_timeout")]
    pub timeout_secs: u64,
    /// Gemini only: use the predefined browser tool instead of JSON replies.
    #[serde(default)]
    pub computer_use: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// SQLite file; defaults to `<data dir>/schedules.db`.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub cron_secret: Option<String>,
    /// Six-field cron expression firing the dispatcher in-process.
    #[serde(default)]
    pub internal_cron: Option<String>,
    #[serde(default)]
    pub launcher: LauncherKind,
    #[serde(default)]
    pub remote_base_url: Option<String>,
    #[serde(default)]
    pub remote_token: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    17890
}
fn default_max_steps() -> u32 {
    DEFAULT_MAX_STEPS
}
fn default_history_window() -> usize {
    8
}
fn default_action_timeout() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_wall_clock() -> u64 {
    15 * 60
}
fn default_session_close() -> u64 {
    15
}
fn default_job_ttl() -> u64 {
    60 * 60
}
fn default_true() -> bool {
    true
}
fn default_provider() -> ProviderType {
    ProviderType::Google
}
fn default_vision_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: None,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_max_steps: default_max_steps(),
            history_window: default_history_window(),
            action_timeout_secs: default_action_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            wall_clock_secs: default_wall_clock(),
            session_close_secs: default_session_close(),
            job_ttl_secs: default_job_ttl(),
            headless: true,
            chrome_path: None,
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            base_url: None,
            timeout_secs: default_vision_timeout(),
            computer_use: false,
        }
    }
}

impl AppConfig {
    /// Loads `path` (or the default location). A missing file yields defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let parsed = Self::from_toml_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            parsed
        } else {
            info!("No {} found, using defaults.", path.display());
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var("CRON_SECRET")
            && !secret.trim().is_empty()
        {
            self.schedule.cron_secret = Some(secret);
        }
        if let Ok(token) = std::env::var("FUNNEL_SWIPER_API_TOKEN")
            && !token.trim().is_empty()
        {
            self.server.api_token = Some(token);
        }
        if let Ok(path) = std::env::var("CHROMIUM_PATH")
            && !path.trim().is_empty()
        {
            self.runner.chrome_path = Some(PathBuf::from(path));
        }
        // Provider keys are resolved lazily by the vision factory.
    }

    pub fn database_path(&self) -> PathBuf {
        self.schedule
            .database
            .clone()
            .unwrap_or_else(|| data_dir().join("schedules.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_means_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.port, 17890);
        assert_eq!(config.runner.default_max_steps, 100);
        assert_eq!(config.runner.retry_attempts, 3);
        assert_eq!(config.runner.wall_clock_secs, 900);
        assert_eq!(config.vision.provider, ProviderType::Google);
        assert_eq!(config.schedule.launcher, LauncherKind::Local);
    }

    #[test]
    fn sections_override_selectively() {
        let config = AppConfig::from_toml_str(
            r#"
            [server]
            port = 9000

            [runner]
            history_window = 4
            headless = false

            [vision]
            provider = "anthropic"
            model = "claude-opus-4-1"

            [schedule]
            launcher = "remote"
            remote_base_url = "https://worker.internal"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.runner.history_window, 4);
        assert!(!config.runner.headless);
        assert_eq!(config.runner.action_timeout_secs, 30);
        assert_eq!(config.vision.provider, ProviderType::Anthropic);
        assert_eq!(config.vision.model.as_deref(), Some("claude-opus-4-1"));
        assert_eq!(config.schedule.launcher, LauncherKind::Remote);
    }

    #[test]
    fn shipped_example_matches_defaults() {
        let example = AppConfig::from_toml_str(include_str!(
            "../../config/funnel-swiper.example.toml"
        ))
        .unwrap();
        let defaults = AppConfig::default();
        assert_eq!(example.server.port, defaults.server.port);
        assert_eq!(example.runner.history_window, defaults.runner.history_window);
        assert_eq!(example.runner.job_ttl_secs, defaults.runner.job_ttl_secs);
        assert_eq!(
            example.runner.session_close_secs,
            defaults.runner.session_close_secs
        );
        assert_eq!(example.vision.provider, defaults.vision.provider);
        assert!(example.schedule.internal_cron.is_none());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(AppConfig::from_toml_str("[vision]\nprovider = \"mistral\"").is_err());
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml")))
            .await
            .unwrap();
        assert_eq!(config.server.port, 17890);
    }

    #[tokio::test]
    async fn explicit_database_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        tokio::fs::write(&path, "[schedule]\ndatabase = \"/tmp/fs.db\"\n")
            .await
            .unwrap();
        let config = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/fs.db"));
    }
}
