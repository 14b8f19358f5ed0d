//! Chat completion capability and its HTTP providers.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

mod anthropic;
mod openai;

pub use anthropic::AnthropicChatter;
pub use openai::OpenAiChatter;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person asking questions.
    User,
    /// The assistant's previous replies.
    Assistant,
}

impl Role {
    /// Wire label shared by both providers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker.
    pub role: Role,
    /// Turn text.
    pub content: String,
}

impl ChatMessage {
    /// Builds a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Builds an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request envelope shared by the various providers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// System instructions.
    pub system: String,
    /// Conversation, oldest first, ending with the current user turn.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token limit.
    pub max_tokens: usize,
}

/// Produces a reply for a conversation.
pub trait Chatter: Send + Sync {
    /// Model identifier, for logs.
    fn model(&self) -> &str;

    /// Returns the reply text.
    fn complete(&self, request: &ChatRequest) -> Result<String, ChatError>;
}

/// Supported chat providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ChatProvider {
    /// OpenAI chat completions.
    Openai,
    /// Anthropic messages API.
    Anthropic,
}

fn classify_status(status: StatusCode, body: String) -> ChatError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ChatError::RateLimited
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        ChatError::Timeout
    } else if status.is_server_error() {
        ChatError::Unavailable(format!("{status}: {body}"))
    } else {
        ChatError::Rejected(format!("{status}: {body}"))
    }
}

fn classify_transport_error(err: reqwest::Error) -> ChatError {
    if err.is_timeout() {
        ChatError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ChatError::Unavailable(err.to_string())
    } else {
        ChatError::Rejected(err.to_string())
    }
}
