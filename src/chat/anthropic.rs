use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{classify_status, classify_transport_error, ChatRequest, Chatter, Role};
use crate::error::{ChatError, RagError, Result};

const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic messages API client.
pub struct AnthropicChatter {
    model: String,
    client: Client,
}

impl AnthropicChatter {
    /// Builds a client for the messages endpoint.
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|_| RagError::config("invalid Anthropic API key"))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| {
                RagError::config(format!("failed to build Anthropic HTTP client: {err}"))
            })?;
        Ok(Self {
            model: model.to_string(),
            client,
        })
    }
}

impl Chatter for AnthropicChatter {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &ChatRequest) -> std::result::Result<String, ChatError> {
        // The messages API requires the conversation to open with a user turn.
        let messages = request
            .messages
            .iter()
            .skip_while(|message| message.role != Role::User)
            .map(|message| AnthropicMessage {
                role: message.role.as_str(),
                content: vec![AnthropicContentBlock {
                    kind: "text",
                    text: &message.content,
                }],
            })
            .collect();
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages,
        };

        let resp = self
            .client
            .post(ANTHROPIC_ENDPOINT)
            .json(&body)
            .send()
            .map_err(classify_transport_error)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, text));
        }
        let parsed: AnthropicResponse = resp.json().map_err(|err| {
            ChatError::Unavailable(format!("failed to parse Anthropic response: {err}"))
        })?;
        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if answer.trim().is_empty() {
            return Err(ChatError::EmptyResponse);
        }
        Ok(answer)
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<AnthropicContentBlock<'a>>,
}

#[derive(Serialize)]
struct AnthropicContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
