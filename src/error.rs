//! Error taxonomy shared by the ingestion and query paths.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, RagError>;

/// Top-level failure for ingestion runs and query turns.
#[derive(Debug, Error)]
pub enum RagError {
    /// Malformed source markdown. The pipeline recovers from this locally.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A retryable embedding failure (throttling, timeout, outage) outlasted
    /// every attempt.
    #[error("embedding capability still failing after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Attempts made for the failing batch.
        attempts: usize,
        /// Error returned by the final attempt.
        last: EmbedError,
    },

    /// Non-retryable embedding failure.
    #[error("embedding request failed: {0}")]
    Embedding(#[from] EmbedError),

    /// Metadata that cannot be flattened into a store-compatible primitive.
    #[error("metadata field `{key}` of record {record_id} cannot be stored: {reason}")]
    MetadataCoercion {
        /// Record whose metadata failed coercion.
        record_id: String,
        /// Offending metadata key.
        key: String,
        /// Why the value was rejected.
        reason: CoercionError,
    },

    /// Query-time embedding model differs from the one that built the collection.
    #[error(
        "collection `{collection}` was built with {indexed_model} ({indexed_dimensions:?} dims) \
         but queries use {query_model} ({query_dimensions:?} dims); rebuild the collection or \
         switch the embedding model back"
    )]
    EmbeddingSpaceMismatch {
        /// Collection being queried.
        collection: String,
        /// Model recorded in the collection manifest.
        indexed_model: String,
        /// Vector dimension recorded in the collection manifest.
        indexed_dimensions: Option<usize>,
        /// Model configured for queries.
        query_model: String,
        /// Dimension of the query vector, when one was produced.
        query_dimensions: Option<usize>,
    },

    /// The named collection has never been ingested.
    #[error("collection `{0}` does not exist; run an ingestion first")]
    CollectionNotFound(String),

    /// Vector store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Chat completion failure.
    #[error("chat completion failed: {0}")]
    Chat(#[from] ChatError),

    /// Invalid configuration values.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure while reading sources or config files.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl RagError {
    /// Builds a configuration error from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Markdown structure problems detected while chunking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A fenced code block that is never closed.
    #[error("code fence opened on line {line} is never closed")]
    UnterminatedFence {
        /// 1-based line number of the opening fence.
        line: usize,
    },
}

/// Failures reported by an [`Embedder`](crate::embedder::Embedder).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbedError {
    /// HTTP 429 or an equivalent throttling signal.
    #[error("rate limited by the embedding capability")]
    RateLimited {
        /// Server-provided hint for when to retry.
        retry_after: Option<Duration>,
    },
    /// The request exceeded the client timeout.
    #[error("embedding request timed out")]
    Timeout,
    /// Transient server or connection failure.
    #[error("embedding capability unavailable: {0}")]
    Unavailable(String),
    /// The capability refused the request (auth, bad input, unknown model).
    #[error("embedding request rejected: {0}")]
    Rejected(String),
    /// The response could not be interpreted.
    #[error("malformed embedding response: {0}")]
    InvalidResponse(String),
}

impl EmbedError {
    /// Whether the same batch may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout | Self::Unavailable(_)
        )
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failures reported by a [`Chatter`](crate::chat::Chatter).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// HTTP 429 from the chat capability.
    #[error("rate limited by the chat capability")]
    RateLimited,
    /// The request exceeded the client timeout.
    #[error("chat request timed out")]
    Timeout,
    /// Transient server or connection failure.
    #[error("chat capability unavailable: {0}")]
    Unavailable(String),
    /// The capability refused the request.
    #[error("chat request rejected: {0}")]
    Rejected(String),
    /// The response carried no usable text.
    #[error("chat response missing text content")]
    EmptyResponse,
}

/// Reasons a metadata value cannot be stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    /// `null` has no primitive representation in the store.
    #[error("null values are not storable")]
    Null,
    /// Nested mappings are rejected by the store.
    #[error("nested mappings are not storable")]
    Mapping,
    /// Lists may only contain scalars.
    #[error("lists may only contain strings, numbers or booleans")]
    NestedList,
    /// Empty list items would vanish when the flattened string is split.
    #[error("list items must not be empty")]
    EmptyListItem,
    /// An item containing the delimiter would split into several items.
    #[error("list item {0:?} contains the list delimiter")]
    DelimiterInListItem(String),
}

/// Failures reported by a [`VectorStore`](crate::store::VectorStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Postgres driver error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    /// Snapshot file could not be read or written.
    #[error("snapshot io error at {path}: {source}")]
    Snapshot {
        /// Snapshot path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Snapshot or metadata (de)serialization failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    /// The collection does not exist in the store.
    #[error("collection `{0}` does not exist")]
    MissingCollection(String),
    /// A vector does not match the collection dimension.
    #[error("vector dimension {actual} does not match collection dimension {expected}")]
    Dimension {
        /// Dimension recorded for the collection.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },
    /// Anything else the backend reports.
    #[error("vector store backend error: {0}")]
    Backend(String),
}
