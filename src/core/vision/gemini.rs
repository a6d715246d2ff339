use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{
    Decision, DecisionRequest, Role, VisionClient, VisionError, classify_status,
    classify_transport, conversation_turns, http_client, parse_decision, truncate,
};
use crate::core::browser::{BrowserAction, GRID_MAX, Viewport};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Built-in browser functions the executor has no equivalent for.
const EXCLUDED_FUNCTIONS: [&str; 4] = ["hover_at", "key_combination", "drag_and_drop", "search"];

#[derive(Serialize)]
struct GeminiRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GeminiPart<'a> {
    Text { text: String },
    Image { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'static str,
    data: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResContent {
    #[serde(default)]
    parts: Vec<GeminiResPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResPart {
    text: Option<String>,
    #[serde(alias = "function_call")]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

/// Gemini adapter. In computer-use mode the model answers with predefined
/// browser function calls, which are mapped onto the executor vocabulary;
/// otherwise it is asked for the plain JSON decision format.
pub struct GeminiVisionClient {
    api_key: String,
    model: String,
    base_url: String,
    computer_use: bool,
    client: Client,
}

impl GeminiVisionClient {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        computer_use: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            api_key,
            model,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            computer_use,
            client: http_client(timeout),
        }
    }

    fn build_request<'a>(&self, request: &DecisionRequest<'a>) -> GeminiRequest<'a> {
        let contents = conversation_turns(request)
            .into_iter()
            .map(|turn| {
                let mut parts = vec![GeminiPart::Text { text: turn.text }];
                if let Some(data) = turn.image {
                    parts.push(GeminiPart::Image {
                        inline_data: InlineData {
                            mime_type: "image/png",
                            data,
                        },
                    });
                }
                GeminiContent {
                    role: Some(match turn.role {
                        Role::User => "user",
                        Role::Model => "model",
                    }),
                    parts,
                }
            })
            .collect();

        let tools = if self.computer_use {
            vec![serde_json::json!({
                "computer_use": {
                    "environment": "ENVIRONMENT_BROWSER",
                    "excluded_predefined_functions": EXCLUDED_FUNCTIONS,
                }
            })]
        } else {
            Vec::new()
        };

        GeminiRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text {
                    text: request.history.instruction().to_string(),
                }],
            },
            contents,
            tools,
            generation_config: GenerationConfig {
                temperature: 0.2,
                response_mime_type: (!self.computer_use).then_some("application/json"),
            },
        }
    }
}

#[async_trait]
impl VisionClient for GeminiVisionClient {

    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, VisionError> {
        let viewport = request.viewport;
        let body = self.build_request(&request);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );

        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let parsed: GeminiResponse = res.json().await.map_err(classify_transport)?;
        decision_from_response(parsed, viewport, self.computer_use)
    }
}

fn decision_from_response(
    response: GeminiResponse,
    viewport: Viewport,
    computer_use: bool,
) -> Result<Decision, VisionError> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(VisionError::Parse("response carried no candidates".into()));
    };
    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
    if parts.is_empty() {
        return Err(VisionError::Parse(format!(
            "empty candidate (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    let mut text = String::new();
    let mut call = None;
    for part in parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if call.is_none() {
            call = part.function_call;
        }
    }

    if let Some(call) = call {
        let reasoning = (!text.trim().is_empty()).then(|| text.trim().to_string());
        let action = map_function_call(&call, viewport)?;
        debug!("Gemini function call {} -> {}", call.name, action.kind());
        return Ok(Decision::Act { action, reasoning });
    }

    match parse_decision(&text) {
        Ok(decision) => Ok(decision),
        // A computer-use model that stops calling functions has finished.
        Err(_) if computer_use && !text.trim().is_empty() => Ok(Decision::Done {
            summary: Some(truncate(text.trim(), 2_000)),
        }),
        Err(e) => Err(e),
    }
}

fn arg_i32(args: &Value, key: &str) -> Result<i32, VisionError> {
    args.get(key)
        .and_then(Value::as_f64)
        .map(|v| v.round() as i32)
        .ok_or_else(|| VisionError::Parse(format!("function call missing numeric `{key}`")))
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, VisionError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| VisionError::Parse(format!("function call missing string `{key}`")))
}

fn scroll_delta(direction: &str, amount_x: i32, amount_y: i32) -> Result<(i32, i32), VisionError> {
    match direction {
        "down" => Ok((0, amount_y)),
        "up" => Ok((0, -amount_y)),
        "right" => Ok((amount_x, 0)),
        "left" => Ok((-amount_x, 0)),
        other => Err(VisionError::Parse(format!("unknown scroll direction `{other}`"))),
    }
}

fn map_function_call(call: &FunctionCall, viewport: Viewport) -> Result<BrowserAction, VisionError> {
    let args = &call.args;
    let action = match call.name.as_str() {
        "open_web_browser" => BrowserAction::Wait { ms: 0 },
        "wait_5_seconds" => BrowserAction::Wait { ms: 5_000 },
        "go_back" => BrowserAction::GoBack,
        "navigate" => BrowserAction::Navigate {
            url: arg_str(args, "url")?.to_string(),
        },
        "click_at" => BrowserAction::Click {
            x: arg_i32(args, "x")?,
            y: arg_i32(args, "y")?,
        },
        "type_text_at" => BrowserAction::Type {
            text: arg_str(args, "text")?.to_string(),
            x: arg_i32(args, "x")?,
            y: arg_i32(args, "y")?,
            press_enter: args
                .get("press_enter")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        },
        "scroll_document" => {
            let page_x = (viewport.width as f64 * 0.8) as i32;
            let page_y = (viewport.height as f64 * 0.8) as i32;
            let (dx, dy) = scroll_delta(arg_str(args, "direction")?, page_x, page_y)?;
            BrowserAction::Scroll { dx, dy }
        }
        "scroll_at" => {
            let magnitude = args
                .get("magnitude")
                .and_then(Value::as_f64)
                .unwrap_or(800.0)
                .clamp(0.0, GRID_MAX as f64);
            let px_x = (magnitude / GRID_MAX as f64 * viewport.width as f64).round() as i32;
            let px_y = (magnitude / GRID_MAX as f64 * viewport.height as f64).round() as i32;
            let (dx, dy) = scroll_delta(arg_str(args, "direction")?, px_x, px_y)?;
            BrowserAction::Scroll { dx, dy }
        }
        other => {
            return Err(VisionError::Parse(format!(
                "unsupported function call `{other}`"
            )));
        }
    };
    Ok(action)
}
