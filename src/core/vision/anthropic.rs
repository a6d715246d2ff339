use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    Decision, DecisionRequest, Role, VisionClient, VisionError, classify_status,
    classify_transport, conversation_turns, http_client, parse_decision,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Text { text: String },
    Image { source: ImageSource<'a> },
}

#[derive(Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'static str,
    data: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicVisionClient {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
}

impl AnthropicVisionClient {
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

fn build_messages<'a>(request: &DecisionRequest<'a>) -> Vec<Message<'a>> {
    conversation_turns(request)
        .into_iter()
        .map(|turn| {
            // Images go before the text that refers to them.
            let mut content = Vec::with_capacity(2);
            if let Some(data) = turn.image {
                content.push(ContentBlock::Image {
                    source: ImageSource {
                        kind: "base64",
                        media_type: "image/png",
                        data,
                    },
                });
            }
            content.push(ContentBlock::Text { text: turn.text });
            Message {
                role: match turn.role {
                    Role::User => "user",
                    Role::Model => "assistant",
                },
                content,
            }
        })
        .collect()
}

#[async_trait]
impl VisionClient for AnthropicVisionClient {

    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, VisionError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: 1024,
            system: request.history.instruction(),
            messages: build_messages(&request),
        };

        let res = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let parsed: MessagesResponse = res.json().await.map_err(classify_transport)?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        parse_decision(&text)
    }
}
