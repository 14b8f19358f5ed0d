//! Command-line argument groups shared by the binaries.
//!
//! Every knob can also be supplied through its `PORTFOLIO_*` environment
//! variable (API keys use the providers' conventional names).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::chat::{AnthropicChatter, ChatProvider, Chatter, OpenAiChatter};
use crate::chunker::ChunkerConfig;
use crate::composer::ComposerConfig;
use crate::embedder::openai::DEFAULT_OPENAI_BASE_URL;
use crate::embedder::OpenAiEmbedder;
use crate::emitter::PacingConfig;
use crate::error::{RagError, Result};
use crate::policy::RetrievalPolicy;
use crate::store::{LocalVectorStore, PgVectorStore, VectorStore};

/// Chunk sizing.
#[derive(Args, Debug, Clone)]
pub struct ChunkingArgs {
    /// Upper bound on chunk length in bytes, overlap included.
    #[arg(long, env = "PORTFOLIO_MAX_CHUNK_SIZE", default_value_t = 1000)]
    pub max_chunk_size: usize,

    /// Sections shorter than this are merged into the next one.
    #[arg(long, env = "PORTFOLIO_MIN_CHUNK_SIZE", default_value_t = 100)]
    pub min_chunk_size: usize,

    /// Bytes repeated between consecutive chunks.
    #[arg(long, env = "PORTFOLIO_CHUNK_OVERLAP", default_value_t = 200)]
    pub chunk_overlap: usize,
}

impl ChunkingArgs {
    /// Validated chunker config.
    pub fn build(&self) -> Result<ChunkerConfig> {
        let config = ChunkerConfig {
            max_chunk_size: self.max_chunk_size,
            min_chunk_size: self.min_chunk_size,
            chunk_overlap: self.chunk_overlap,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Embedding capability.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    /// OpenAI API key used for embeddings.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Embedding model identifier; recorded in the collection manifest.
    #[arg(
        long,
        env = "PORTFOLIO_EMBEDDING_MODEL",
        default_value = "text-embedding-3-small"
    )]
    pub embedding_model: String,

    /// Optional embedding dimension override.
    #[arg(long, env = "PORTFOLIO_EMBEDDING_DIMENSIONS")]
    pub embedding_dimensions: Option<usize>,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(long, env = "PORTFOLIO_OPENAI_BASE", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub openai_base_url: String,

    /// Seconds before embedding requests time out.
    #[arg(long, env = "PORTFOLIO_EMBEDDING_TIMEOUT_SECS", default_value_t = 30)]
    pub embedding_timeout_secs: u64,
}

impl EmbedderArgs {
    /// Builds the OpenAI embeddings client.
    pub fn build(&self) -> Result<OpenAiEmbedder> {
        let key = self
            .openai_api_key
            .as_deref()
            .ok_or_else(|| RagError::config("OPENAI_API_KEY (or --openai-api-key) is required"))?;
        OpenAiEmbedder::new(
            key,
            &self.openai_base_url,
            &self.embedding_model,
            self.embedding_dimensions,
            Duration::from_secs(self.embedding_timeout_secs.max(1)),
        )
    }
}

/// Batching, throttling and retries around embedding requests.
#[derive(Args, Debug, Clone)]
pub struct PacingArgs {
    /// Texts per embedding request.
    #[arg(long, env = "PORTFOLIO_EMBEDDING_BATCH", default_value_t = 50)]
    pub embedding_batch_size: usize,

    /// Minimum pause between embedding requests, in milliseconds.
    #[arg(long, env = "PORTFOLIO_THROTTLE_MS", default_value_t = 250)]
    pub throttle_ms: u64,

    /// Provider requests-per-minute budget.
    #[arg(long, env = "PORTFOLIO_EMBEDDING_RPM")]
    pub requests_per_minute: Option<u32>,

    /// Provider tokens-per-minute budget.
    #[arg(long, env = "PORTFOLIO_EMBEDDING_TPM")]
    pub tokens_per_minute: Option<u32>,

    /// Attempts per batch before the run fails.
    #[arg(long, env = "PORTFOLIO_EMBEDDING_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: usize,
}

impl PacingArgs {
    /// Pacing policy for the emitter.
    pub fn build(&self) -> PacingConfig {
        PacingConfig {
            throttle_delay: Duration::from_millis(self.throttle_ms),
            requests_per_minute: self.requests_per_minute,
            tokens_per_minute: self.tokens_per_minute,
            max_retries: self.max_retries.max(1),
        }
    }
}

/// Vector store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// JSON snapshots on local disk.
    Local,
    /// Postgres with the pgvector extension.
    Pgvector,
}

/// Vector store location.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Backend holding the collection.
    #[arg(long, env = "PORTFOLIO_STORE", value_enum, default_value_t = StoreBackend::Local)]
    pub store: StoreBackend,

    /// Snapshot directory for the local backend.
    #[arg(long, env = "PORTFOLIO_STORE_PATH", default_value = "data/vector_store")]
    pub store_path: PathBuf,

    /// Postgres connection string for the pgvector backend.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Schema holding pgvector tables.
    #[arg(long, env = "PORTFOLIO_PG_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Collection name.
    #[arg(long, env = "PORTFOLIO_COLLECTION", default_value = "portfolio")]
    pub collection: String,

    /// Records per store write.
    #[arg(long, env = "PORTFOLIO_WRITE_BATCH", default_value_t = 128)]
    pub write_batch_size: usize,
}

impl StoreArgs {
    /// Opens the configured backend.
    ///
    /// Must be called outside any tokio runtime: the pgvector backend owns one.
    pub fn open(&self) -> Result<Arc<dyn VectorStore>> {
        match self.store {
            StoreBackend::Local => Ok(Arc::new(LocalVectorStore::open(&self.store_path)?)),
            StoreBackend::Pgvector => {
                let url = self.database_url.as_deref().ok_or_else(|| {
                    RagError::config("DATABASE_URL (or --database-url) is required for pgvector")
                })?;
                Ok(Arc::new(PgVectorStore::connect(
                    url,
                    &self.schema,
                    self.write_batch_size.max(1),
                )?))
            }
        }
    }
}

/// Chat capability and answer style.
#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// Chat provider answering questions.
    #[arg(long, env = "PORTFOLIO_CHAT_PROVIDER", value_enum, default_value_t = ChatProvider::Openai)]
    pub chat_provider: ChatProvider,

    /// OpenAI chat model.
    #[arg(long, env = "PORTFOLIO_CHAT_MODEL", default_value = "gpt-4o-mini")]
    pub chat_model: String,

    /// Anthropic API key (required with --chat-provider anthropic).
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Anthropic model identifier.
    #[arg(
        long,
        env = "PORTFOLIO_ANTHROPIC_MODEL",
        default_value = "claude-3-5-haiku-latest"
    )]
    pub anthropic_model: String,

    /// Seconds before chat requests time out.
    #[arg(long, env = "PORTFOLIO_CHAT_TIMEOUT_SECS", default_value_t = 60)]
    pub chat_timeout_secs: u64,

    /// Sampling temperature for answers.
    #[arg(long, env = "PORTFOLIO_CHAT_TEMPERATURE", default_value_t = 0.2)]
    pub temperature: f32,

    /// Maximum completion tokens.
    #[arg(long, env = "PORTFOLIO_CHAT_MAX_TOKENS", default_value_t = 600)]
    pub max_completion_tokens: usize,

    /// Who the assistant speaks for.
    #[arg(long, env = "PORTFOLIO_PERSONA")]
    pub persona: Option<String>,

    /// Default response language.
    #[arg(long, env = "PORTFOLIO_LANGUAGE", default_value = "English")]
    pub language: String,

    /// History turns forwarded to the model.
    #[arg(long, env = "PORTFOLIO_MAX_HISTORY", default_value_t = 10)]
    pub max_history_turns: usize,
}

impl ChatArgs {
    /// Builds the configured chat client. `openai_api_key` comes from [`EmbedderArgs`].
    pub fn build(&self, openai_api_key: Option<&str>) -> Result<Arc<dyn Chatter>> {
        let timeout = Duration::from_secs(self.chat_timeout_secs.max(1));
        match self.chat_provider {
            ChatProvider::Openai => {
                let key = openai_api_key.ok_or_else(|| {
                    RagError::config("OPENAI_API_KEY (or --openai-api-key) is required")
                })?;
                Ok(Arc::new(OpenAiChatter::new(
                    key,
                    DEFAULT_OPENAI_BASE_URL,
                    &self.chat_model,
                    timeout,
                )?))
            }
            ChatProvider::Anthropic => {
                let key = self.anthropic_api_key.as_deref().ok_or_else(|| {
                    RagError::config("ANTHROPIC_API_KEY (or --anthropic-api-key) is required")
                })?;
                Ok(Arc::new(AnthropicChatter::new(
                    key,
                    &self.anthropic_model,
                    timeout,
                )?))
            }
        }
    }

    /// Composer settings.
    pub fn composer_config(&self) -> ComposerConfig {
        let defaults = ComposerConfig::default();
        ComposerConfig {
            persona: self.persona.clone().unwrap_or(defaults.persona),
            language: self.language.clone(),
            temperature: self.temperature,
            max_tokens: self.max_completion_tokens.max(1),
            max_history_turns: self.max_history_turns,
        }
    }
}

/// Retrieval policy source.
#[derive(Args, Debug, Clone)]
pub struct PolicyArgs {
    /// TOML file overriding per-intent top-k, thresholds and classifier rules.
    #[arg(long, env = "PORTFOLIO_POLICY")]
    pub policy: Option<PathBuf>,

    /// Append each intent's expansion terms to embedded queries.
    #[arg(long, env = "PORTFOLIO_EXPAND_QUERIES")]
    pub expand_queries: bool,
}

impl PolicyArgs {
    /// Loads the policy file, or the defaults when none is given.
    pub fn load(&self) -> Result<RetrievalPolicy> {
        let mut policy = match &self.policy {
            Some(path) => RetrievalPolicy::from_toml_file(path)?,
            None => RetrievalPolicy::default(),
        };
        policy.expand_queries |= self.expand_queries;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        chunking: ChunkingArgs,
        #[command(flatten)]
        pacing: PacingArgs,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        policy: PolicyArgs,
    }

    #[test]
    fn flags_override_defaults() {
        let cli = TestCli::try_parse_from([
            "test",
            "--max-chunk-size",
            "500",
            "--chunk-overlap",
            "50",
            "--throttle-ms",
            "1000",
            "--max-retries",
            "0",
            "--store",
            "pgvector",
            "--expand-queries",
        ])
        .unwrap();
        let chunking = cli.chunking.build().unwrap();
        assert_eq!(chunking.max_chunk_size, 500);
        assert_eq!(chunking.chunk_overlap, 50);
        let pacing = cli.pacing.build();
        assert_eq!(pacing.throttle_delay, Duration::from_secs(1));
        assert_eq!(pacing.max_retries, 1);
        assert_eq!(cli.store.store, StoreBackend::Pgvector);
        assert!(cli.policy.load().unwrap().expand_queries);
    }

    #[test]
    fn invalid_chunking_is_rejected() {
        let cli = TestCli::try_parse_from([
            "test",
            "--max-chunk-size",
            "100",
            "--chunk-overlap",
            "100",
        ])
        .unwrap();
        assert!(matches!(cli.chunking.build(), Err(RagError::Config(_))));
    }

    #[test]
    fn pgvector_requires_database_url() {
        let mut cli = TestCli::try_parse_from(["test", "--store", "pgvector"]).unwrap();
        cli.store.database_url = None;
        assert!(matches!(cli.store.open(), Err(RagError::Config(_))));
    }

    #[test]
    fn local_store_opens_snapshot_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = TestCli::try_parse_from(["test"]).unwrap();
        cli.store.store = StoreBackend::Local;
        cli.store.store_path = dir.path().join("store");
        let store = cli.store.open().unwrap();
        assert!(store.manifest("portfolio").unwrap().is_none());
    }
}
