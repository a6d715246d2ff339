//! Vision Decision Client.
//!
//! A client is stateless: every call receives the full (already trimmed)
//! conversation plus the current screenshot and answers with exactly one
//! [`Decision`]. Provider responses are parsed leniently; anything that is
//! not a well-formed decision surfaces as [`VisionError::Parse`] and is never
//! turned into an invented action.

mod anthropic;
mod gemini;
mod openai;
mod prompt;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use anthropic::AnthropicVisionClient;
pub use gemini::GeminiVisionClient;
pub use openai::OpenAiVisionClient;
pub use prompt::build_instruction;

use crate::core::browser::{BrowserAction, Observation, Viewport};
use crate::core::config::VisionConfig;
use crate::core::runner::ConversationHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Google,
    Anthropic,
    OpenAI,
}

impl ProviderType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::Google => "google",
            ProviderType::Anthropic => "anthropic",
            ProviderType::OpenAI => "openai",
        }
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            ProviderType::Google => "GEMINI_API_KEY",
            ProviderType::Anthropic => "ANTHROPIC_API_KEY",
            ProviderType::OpenAI => "OPENAI_API_KEY",
        }
    }

    pub fn default_model(self, computer_use: bool) -> &'static str {
        match self {
            ProviderType::Google if computer_use => "gemini-2.5-computer-use-preview-10-2025",
            ProviderType::Google => "gemini-2.5-flash",
            ProviderType::Anthropic => "claude-sonnet-4-5",
            ProviderType::OpenAI => "gpt-4o",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the model wants to happen next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Act {
        action: BrowserAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Blocked {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub history: &'a ConversationHistory,
    pub observation: &'a Observation,
    pub viewport: Viewport,
    pub step: u32,
    pub max_steps: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("vision provider unreachable: {0}")]
    Transport(String),
    #[error("vision provider timed out: {0}")]
    Timeout(String),
    #[error("vision provider rate limited: {0}")]
    RateLimited(String),
    #[error("vision provider error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    #[error("vision provider rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unparsable vision response: {0}")]
    Parse(String),
}

impl VisionError {
    /// Network-level and provider-side hiccups. Parse failures have their own budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VisionError::Transport(_)
                | VisionError::Timeout(_)
                | VisionError::RateLimited(_)
                | VisionError::Server { .. }
        )
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, VisionError::Parse(_))
    }
}

#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, VisionError>;
}

/// Pulls the JSON payload out of a model reply: fenced block, bare object, or
/// the outermost braces inside surrounding prose.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub fn parse_decision(text: &str) -> Result<Decision, VisionError> {
    let Some(json) = extract_json_block(text) else {
        return Err(VisionError::Parse(format!(
            "no JSON object in reply: {}",
            truncate(text, 200)
        )));
    };
    serde_json::from_str::<Decision>(json)
        .map_err(|e| VisionError::Parse(format!("{e} in {}", truncate(json, 200))))
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    User,
    Model,
}

/// Provider-neutral rendering of one conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Turn<'a> {
    pub role: Role,
    pub text: String,
    pub image: Option<&'a str>,
}

/// Flattens history plus the current observation into alternating user/model
/// turns. Each user turn reports the outcome of the previous action.
pub(crate) fn conversation_turns<'a>(request: &DecisionRequest<'a>) -> Vec<Turn<'a>> {
    let mut turns = Vec::with_capacity(request.history.len() * 2 + 1);
    let mut last_outcome: Option<&str> = None;

    for exchange in request.history.exchanges() {
        turns.push(Turn {
            role: Role::User,
            text: observation_text(last_outcome, &exchange.url, None),
            image: exchange.screenshot.as_deref(),
        });
        let reply = Decision::Act {
            action: exchange.action.clone(),
            reasoning: exchange.reasoning.clone(),
        };
        turns.push(Turn {
            role: Role::Model,
            text: serde_json::to_string(&reply).unwrap_or_default(),
            image: None,
        });
        last_outcome = Some(&exchange.outcome);
    }

    turns.push(Turn {
        role: Role::User,
        text: observation_text(
            last_outcome,
            &request.observation.url,
            Some((request.step, request.max_steps)),
        ),
        image: Some(&request.observation.screenshot),
    });
    turns
}

fn observation_text(outcome: Option<&str>, url: &str, progress: Option<(u32, u32)>) -> String {
    let mut text = String::new();
    if let Some(outcome) = outcome {
        text.push_str(&format!("Result of your last action: {outcome}\n"));
    }
    text.push_str(&format!("Current URL: {url}"));
    if let Some((step, max)) = progress {
        text.push_str(&format!(
            "\nStep {step} of {max}. Reply with the next decision as JSON."
        ));
    }
    text
}

pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> VisionError {
    let message = truncate(body.trim(), 300);
    let code = status.as_u16();
    if code == 429 {
        VisionError::RateLimited(message)
    } else if status.is_server_error() {
        VisionError::Server {
            status: code,
            message,
        }
    } else {
        VisionError::Rejected {
            status: code,
            message,
        }
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> VisionError {
    if err.is_timeout() {
        VisionError::Timeout(err.to_string())
    } else if err.is_decode() {
        VisionError::Parse(err.to_string())
    } else {
        VisionError::Transport(err.to_string())
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Builds the configured provider. Fails when no API key can be resolved.
pub fn build_vision_client(config: &VisionConfig) -> Result<Arc<dyn VisionClient>> {
    let provider = config.provider;
    let api_key = match config.api_key.clone().filter(|k| !k.trim().is_empty()) {
        Some(key) => key,
        None => match std::env::var(provider.api_key_env()) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!(
                "no API key for vision provider '{}': set vision.api_key or {}",
                provider,
                provider.api_key_env()
            ),
        },
    };
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| provider.default_model(config.computer_use).to_string());
    let timeout = Duration::from_secs(config.timeout_secs);
    info!("Vision provider: {} ({})", provider, model);

    let client: Arc<dyn VisionClient> = match provider {
        ProviderType::Google => Arc::new(GeminiVisionClient::new(
            api_key,
            model,
            config.base_url.clone(),
            config.computer_use,
            timeout,
        )),
        ProviderType::Anthropic => Arc::new(AnthropicVisionClient::new(
            api_key,
            model,
            config.base_url.clone(),
            timeout,
        )),
        ProviderType::OpenAI => Arc::new(OpenAiVisionClient::new(
            api_key,
            model,
            config.base_url.clone(),
            timeout,
        )),
    };
    Ok(client)
}
