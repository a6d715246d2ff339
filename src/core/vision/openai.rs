use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    Decision, DecisionRequest, Role, VisionClient, VisionError, classify_status,
    classify_transport, conversation_turns, http_client, parse_decision,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiVisionClient {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
}

impl OpenAiVisionClient {
    pub fn new(api_key: String, model: String, base_url: Option<String>, timeout: Duration) -> Self {
        Self {
            api_key,
            model,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client: http_client(timeout),
        }
    }
}

fn build_messages(request: &DecisionRequest<'_>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage {
        role: "system",
        content: vec![ContentPart::Text {
            text: request.history.instruction().to_string(),
        }],
    }];
    for turn in conversation_turns(request) {
        let mut content = vec![ContentPart::Text { text: turn.text }];
        // Assistant turns are text-only in the chat completions API.
        if turn.role == Role::User
            && let Some(data) = turn.image
        {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/png;base64,{data}"),
                },
            });
        }
        messages.push(ChatMessage {
            role: match turn.role {
                Role::User => "user",
                Role::Model => "assistant",
            },
            content,
        });
    }
    messages
}

#[async_trait]
impl VisionClient for OpenAiVisionClient {

    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, VisionError> {
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(&request),
            response_format: ResponseFormat {
                kind: "json_object",
            },
            temperature: 0.2,
        };

        let res = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let parsed: ChatResponse = res.json().await.map_err(classify_transport)?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        parse_decision(&text)
    }
}
