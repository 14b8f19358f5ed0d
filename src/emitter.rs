//! Paced, retrying batch embedding.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chunker::Chunk;
use crate::embedder::Embedder;
use crate::error::{EmbedError, RagError, Result};

/// Blocking delay source, swappable in tests.
pub trait Sleeper: Send + Sync {
    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Request pacing and retry policy for the embedding capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    /// Minimum delay between consecutive batches.
    pub throttle_delay: Duration,
    /// Requests-per-minute budget, if the provider enforces one.
    pub requests_per_minute: Option<u32>,
    /// Tokens-per-minute budget, if the provider enforces one.
    pub tokens_per_minute: Option<u32>,
    /// Total attempts per batch before giving up.
    pub max_retries: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            throttle_delay: Duration::from_millis(250),
            requests_per_minute: None,
            tokens_per_minute: None,
            max_retries: 5,
        }
    }
}

impl PacingConfig {
    /// Delay to leave after a batch with `tokens` estimated tokens.
    pub fn delay_after(&self, tokens: usize) -> Duration {
        let minute = Duration::from_secs(60);
        let mut delay = self.throttle_delay;
        if let Some(rpm) = self.requests_per_minute.filter(|rpm| *rpm > 0) {
            delay = delay.max(minute / rpm);
        }
        if let Some(tpm) = self.tokens_per_minute.filter(|tpm| *tpm > 0) {
            let secs = tokens as f64 * 60.0 / f64::from(tpm);
            delay = delay.max(Duration::from_secs_f64(secs));
        }
        delay
    }
}

/// Rough token estimate used for tokens-per-minute pacing.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    words.max(text.len() / 4).max(1)
}

/// Exponential retry delay, honoring a server hint when one is given.
pub fn retry_backoff(attempt: usize, hint: Option<Duration>) -> Duration {
    if let Some(hint) = hint {
        return hint;
    }
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

/// Sends texts to an [`Embedder`] in paced batches.
pub struct EmbeddingEmitter {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    pacing: PacingConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl EmbeddingEmitter {
    /// Builds an emitter that sleeps on the calling thread.
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize, pacing: PacingConfig) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            pacing,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    /// Replaces the delay source.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Batch size in use.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches needed for `inputs` texts.
    pub fn batch_count(&self, inputs: usize) -> usize {
        inputs.div_ceil(self.batch_size)
    }

    /// Embeds every chunk's heading-prefixed text, preserving order.
    pub fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = chunks.iter().map(Chunk::embedding_text).collect();
        self.embed_texts(&texts)
    }

    /// Embeds `texts`, returning vectors in input order.
    ///
    /// Every vector has the same dimension; a provider that disagrees with
    /// itself is a fatal error.
    pub fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let batches = self.batch_count(texts.len());
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        let mut dimension: Option<usize> = None;

        for (batch_idx, batch) in texts.chunks(self.batch_size).enumerate() {
            if batch_idx > 0 {
                let tokens = batch.iter().map(|text| estimate_tokens(text)).sum();
                let delay = self.pacing.delay_after(tokens);
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "pacing embedding requests");
                    self.sleeper.sleep(delay);
                }
            }

            let inputs: Vec<&str> = batch.iter().map(String::as_str).collect();
            let embedded = self.embed_with_retry(batch_idx, &inputs)?;
            if embedded.len() != inputs.len() {
                return Err(RagError::Embedding(EmbedError::InvalidResponse(format!(
                    "batch {batch_idx} returned {} vectors for {} inputs",
                    embedded.len(),
                    inputs.len()
                ))));
            }
            for vector in embedded {
                let expected = *dimension.get_or_insert(vector.len());
                if vector.len() != expected || expected == 0 {
                    return Err(RagError::Embedding(EmbedError::InvalidResponse(format!(
                        "vector dimension {} does not match {expected}",
                        vector.len()
                    ))));
                }
                vectors.push(vector);
            }
            info!(
                batch = batch_idx + 1,
                batches,
                embedded = vectors.len(),
                "embedded batch"
            );
        }
        Ok(vectors)
    }

    fn embed_with_retry(&self, batch_idx: usize, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let max_attempts = self.pacing.max_retries.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.embedder.embed_batch(inputs) {
                Ok(vectors) => return Ok(vectors),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = retry_backoff(attempt, err.retry_after());
                    warn!(
                        batch = batch_idx,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "embedding batch failed; retrying"
                    );
                    self.sleeper.sleep(delay);
                }
                Err(err) if err.is_retryable() => {
                    return Err(RagError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
                Err(err) => return Err(RagError::Embedding(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    /// Returns scripted failures first, then `[len, 1.0]` vectors.
    #[derive(Default)]
    struct ScriptedEmbedder {
        failures: Mutex<VecDeque<EmbedError>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedEmbedder {
        fn failing(failures: Vec<EmbedError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                calls: Mutex::default(),
            }
        }
    }

    impl Embedder for ScriptedEmbedder {
        fn model(&self) -> &str {
            "scripted"
        }

        fn embed_batch(&self, inputs: &[&str]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
            self.calls
                .lock()
                .unwrap()
                .push(inputs.iter().map(|s| s.to_string()).collect());
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(inputs.iter().map(|s| vec![s.len() as f32, 1.0]).collect())
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("chunk {i}")).collect()
    }

    fn pacing(throttle: Duration, max_retries: usize) -> PacingConfig {
        PacingConfig {
            throttle_delay: throttle,
            requests_per_minute: None,
            tokens_per_minute: None,
            max_retries,
        }
    }

    #[test]
    fn paces_between_batches_only() {
        let embedder = Arc::new(ScriptedEmbedder::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let emitter = EmbeddingEmitter::new(embedder.clone(), 50, pacing(Duration::from_secs(1), 3))
            .with_sleeper(sleeper.clone());

        let vectors = emitter.embed_texts(&texts(250)).unwrap();

        assert_eq!(vectors.len(), 250);
        assert_eq!(embedder.calls.lock().unwrap().len(), 5);
        assert_eq!(
            *sleeper.sleeps.lock().unwrap(),
            vec![Duration::from_secs(1); 4]
        );
    }

    #[test]
    fn preserves_input_order_across_batches() {
        let embedder = Arc::new(ScriptedEmbedder::default());
        let emitter = EmbeddingEmitter::new(embedder.clone(), 3, pacing(Duration::ZERO, 1))
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let inputs = texts(7);
        emitter.embed_texts(&inputs).unwrap();

        let sent: Vec<String> = embedder.calls.lock().unwrap().concat();
        assert_eq!(sent, inputs);
    }

    #[test]
    fn retries_transient_failures_with_backoff() {
        let embedder = Arc::new(ScriptedEmbedder::failing(vec![
            EmbedError::RateLimited { retry_after: None },
            EmbedError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            },
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let emitter = EmbeddingEmitter::new(embedder.clone(), 10, pacing(Duration::ZERO, 5))
            .with_sleeper(sleeper.clone());

        let vectors = emitter.embed_texts(&texts(4)).unwrap();

        assert_eq!(vectors.len(), 4);
        assert_eq!(embedder.calls.lock().unwrap().len(), 3);
        assert_eq!(
            *sleeper.sleeps.lock().unwrap(),
            vec![Duration::from_millis(1000), Duration::from_secs(7)]
        );
    }

    #[test]
    fn exhausted_retries_are_fatal() {
        let embedder = Arc::new(ScriptedEmbedder::failing(vec![
            EmbedError::Timeout,
            EmbedError::RateLimited { retry_after: None },
            EmbedError::RateLimited { retry_after: None },
        ]));
        let emitter = EmbeddingEmitter::new(embedder.clone(), 10, pacing(Duration::ZERO, 3))
            .with_sleeper(Arc::new(RecordingSleeper::default()));

        let err = emitter.embed_texts(&texts(2)).unwrap_err();
        assert!(matches!(
            err,
            RagError::RetriesExhausted {
                attempts: 3,
                last: EmbedError::RateLimited { .. }
            }
        ));
        assert_eq!(embedder.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn exhausted_timeouts_keep_the_last_cause() {
        let embedder = Arc::new(ScriptedEmbedder::failing(vec![
            EmbedError::Timeout,
            EmbedError::Timeout,
        ]));
        let emitter = EmbeddingEmitter::new(embedder, 10, pacing(Duration::ZERO, 2))
            .with_sleeper(Arc::new(RecordingSleeper::default()));

        let err = emitter.embed_texts(&texts(1)).unwrap_err();
        assert!(matches!(
            err,
            RagError::RetriesExhausted {
                attempts: 2,
                last: EmbedError::Timeout
            }
        ));
        assert!(!err.to_string().contains("rate"));
    }

    #[test]
    fn rejected_requests_are_not_retried() {
        let embedder = Arc::new(ScriptedEmbedder::failing(vec![EmbedError::Rejected(
            "401".into(),
        )]));
        let emitter = EmbeddingEmitter::new(embedder.clone(), 10, pacing(Duration::ZERO, 5))
            .with_sleeper(Arc::new(RecordingSleeper::default()));

        let err = emitter.embed_texts(&texts(2)).unwrap_err();
        assert!(matches!(err, RagError::Embedding(EmbedError::Rejected(_))));
        assert_eq!(embedder.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn pacing_honors_rate_budgets() {
        let config = PacingConfig {
            throttle_delay: Duration::from_millis(100),
            requests_per_minute: Some(30),
            tokens_per_minute: Some(6_000),
            max_retries: 1,
        };
        assert_eq!(config.delay_after(10), Duration::from_secs(2));
        assert_eq!(config.delay_after(600), Duration::from_secs(6));
    }
}
