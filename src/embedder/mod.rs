//! Embedding capability abstraction.

use crate::error::EmbedError;

pub mod openai;

pub use openai::OpenAiEmbedder;

/// Turns text into fixed-dimension vectors.
///
/// Implementations make a single attempt per call; pacing and retries live in
/// [`EmbeddingEmitter`](crate::emitter::EmbeddingEmitter).
pub trait Embedder: Send + Sync {
    /// Model identifier recorded in collection manifests.
    fn model(&self) -> &str;

    /// Embeds a batch, returning one vector per input in input order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Embeds a single input.
    fn embed_one(&self, input: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_batch(&[input])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::InvalidResponse("no embedding returned".into()))
    }
}
