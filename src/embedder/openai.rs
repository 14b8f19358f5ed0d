//! OpenAI-based embedding client implementation.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Embedder;
use crate::error::{EmbedError, RagError, Result};

/// Default OpenAI-compatible API root.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI's per-request input limit for the embeddings endpoint.
pub const MAX_INPUTS_PER_REQUEST: usize = 2048;

/// Blocking embeddings client that talks to OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    /// Builds a new OpenAI embeddings client.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(RagError::config("missing OpenAI API key"));
        }
        if model.trim().is_empty() {
            return Err(RagError::config("missing OpenAI embedding model name"));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| RagError::config("invalid OpenAI API key"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::config(format!("failed to build OpenAI HTTP client: {err}")))?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model: model.trim().to_string(),
            dimensions,
        })
    }

    /// Requested output dimension, if the model was asked to shorten vectors.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }
}

impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn embed_batch(&self, inputs: &[&str]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        if inputs.len() > MAX_INPUTS_PER_REQUEST {
            return Err(EmbedError::Rejected(format!(
                "batch of {} exceeds the {} input limit",
                inputs.len(),
                MAX_INPUTS_PER_REQUEST
            )));
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, response));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .map_err(|err| EmbedError::InvalidResponse(err.to_string()))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(EmbedError::InvalidResponse(format!(
                "OpenAI returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }
        debug!(inputs = inputs.len(), model = %self.model, "embedded batch");
        Ok(parsed
            .data
            .into_iter()
            .map(|entry| entry.embedding)
            .collect())
    }
}

fn classify_status(status: StatusCode, response: Response) -> EmbedError {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64);
    let body = response
        .text()
        .unwrap_or_else(|_| "<body unavailable>".to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        EmbedError::RateLimited { retry_after }
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        EmbedError::Timeout
    } else if status.is_server_error() {
        EmbedError::Unavailable(format!("{status}: {body}"))
    } else {
        EmbedError::Rejected(format!("{status}: {body}"))
    }
}

fn classify_transport_error(err: reqwest::Error) -> EmbedError {
    if err.is_timeout() {
        EmbedError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        EmbedError::Unavailable(err.to_string())
    } else {
        EmbedError::Rejected(err.to_string())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(borrow)]
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
