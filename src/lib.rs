#![warn(missing_docs)]
//! Markdown-aware ingestion and retrieval pipeline behind a resume/portfolio
//! chat assistant.
//!
//! Ingestion runs `DocumentLoader -> MarkdownChunker -> EntityExtractor ->
//! EmbeddingEmitter -> VectorIndexWriter` (see [`IngestPipeline`]); each chat
//! turn runs `QueryClassifier -> Retriever -> AnswerComposer`.

pub mod chat;
pub mod chunker;
pub mod classifier;
pub mod composer;
pub mod config;
pub mod embedder;
pub mod embeddings;
pub mod emitter;
pub mod entities;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod metadata;
pub mod pipeline;
pub mod policy;
pub mod retriever;
pub mod store;
pub mod telemetry;
pub mod writer;

pub use chat::{ChatMessage, ChatRequest, Chatter, Role};
pub use chunker::{Chunk, ChunkerConfig, MarkdownChunker, SectionHeading};
pub use classifier::{Intent, QueryClassifier};
pub use composer::{AnswerComposer, ComposerConfig, FAILED_RESPONSE};
pub use embedder::Embedder;
pub use embeddings::EmbeddingRecord;
pub use emitter::{EmbeddingEmitter, PacingConfig};
pub use entities::{EntityExtractor, EntityKind, EntityMap, SkillLexicon};
pub use error::{RagError, Result};
pub use loader::{DocumentLoader, SourceDocument};
pub use manifest::CollectionManifest;
pub use metadata::{Metadata, MetadataFilter, Primitive};
pub use pipeline::{IngestConfig, IngestPipeline, IngestReport};
pub use policy::RetrievalPolicy;
pub use retriever::{Query, RetrievalResult, RetrievedChunk, Retriever};
pub use store::{LocalVectorStore, PgVectorStore, VectorStore};
pub use writer::VectorIndexWriter;
