//! Prompt assembly and answer generation over retrieved chunks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chat::{ChatMessage, ChatRequest, Chatter, Role};
use crate::entities::EntityKind;
use crate::error::Result;
use crate::metadata::Primitive;
use crate::retriever::{RetrievalResult, RetrievedChunk};

/// Message returned to API callers whenever the chat capability fails.
pub const FAILED_RESPONSE: &str = "failed to get response";

/// Knobs for answer generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// Who the assistant speaks for.
    pub persona: String,
    /// Response language used when the caller does not pick one.
    pub language: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token limit.
    pub max_tokens: usize,
    /// Most recent history turns forwarded to the model.
    pub max_history_turns: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            persona: "the portfolio owner's assistant, answering questions about their \
                      professional background"
                .to_string(),
            language: "English".to_string(),
            temperature: 0.2,
            max_tokens: 600,
            max_history_turns: 10,
        }
    }
}

/// Turns a question plus retrieval result into a chat completion.
pub struct AnswerComposer {
    chatter: Arc<dyn Chatter>,
    config: ComposerConfig,
}

impl AnswerComposer {
    /// Creates a composer over `chatter`.
    pub fn new(chatter: Arc<dyn Chatter>, config: ComposerConfig) -> Self {
        Self { chatter, config }
    }

    /// Active configuration.
    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Builds the request without sending it.
    pub fn build_request(
        &self,
        question: &str,
        retrieval: &RetrievalResult,
        history: &[ChatMessage],
        language: Option<&str>,
    ) -> ChatRequest {
        let language = language
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .unwrap_or(&self.config.language);
        let turns: Vec<&ChatMessage> = history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .collect();
        let skip = turns.len().saturating_sub(self.config.max_history_turns);
        let mut messages: Vec<ChatMessage> = turns.into_iter().skip(skip).cloned().collect();
        messages.push(ChatMessage {
            role: Role::User,
            content: question.trim().to_string(),
        });
        ChatRequest {
            system: system_prompt(&self.config.persona, language, &retrieval.hits),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    /// Generates an answer. Chat failures come back as [`crate::RagError::Chat`].
    pub fn compose(
        &self,
        question: &str,
        retrieval: &RetrievalResult,
        history: &[ChatMessage],
        language: Option<&str>,
    ) -> Result<String> {
        let request = self.build_request(question, retrieval, history, language);
        debug!(
            model = self.chatter.model(),
            context_chunks = retrieval.hits.len(),
            history = request.messages.len() - 1,
            "requesting completion"
        );
        match self.chatter.complete(&request) {
            Ok(answer) => Ok(answer.trim().to_string()),
            Err(err) => {
                warn!(model = self.chatter.model(), error = %err, "chat completion failed");
                Err(err.into())
            }
        }
    }
}

fn system_prompt(persona: &str, language: &str, hits: &[RetrievedChunk]) -> String {
    let mut prompt = format!(
        "You are {persona}. Answer only from the context below and respond in {language}.\n\n"
    );
    if hits.is_empty() {
        prompt.push_str(
            "No relevant context was found for this question. Say that you have limited \
             information on this topic instead of inventing details.\n",
        );
        return prompt;
    }
    prompt.push_str("Context:\n");
    prompt.push_str(&render_context(hits));
    prompt.push_str(
        "\nIf the context does not cover the question, say that you have limited information \
         rather than guessing.\n",
    );
    prompt
}

/// Renders hits as numbered context blocks. Entity fields found in the
/// hit metadata are listed under the score line when non-empty.
pub fn render_context(hits: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    for (idx, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "[{}] Source: {}\nSection: {}\nScore: {:.3}\n",
            idx + 1,
            hit.source_document.as_deref().unwrap_or(&hit.id),
            hit.heading_path.as_deref().unwrap_or("(none)"),
            hit.score,
        ));
        for kind in EntityKind::ALL {
            let values = hit
                .metadata
                .get(kind.metadata_key())
                .and_then(Primitive::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if !values.is_empty() {
                out.push_str(&format!("{}: {values}\n", kind.label()));
            }
        }
        out.push_str(&format!("{}\n---\n", hit.text.trim()));
    }
    out
}
