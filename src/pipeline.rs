//! End-to-end ingestion run: load, chunk, extract, embed, write.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::chunker::{Chunk, ChunkerConfig, MarkdownChunker};
use crate::embedder::Embedder;
use crate::embeddings::EmbeddingRecord;
use crate::emitter::{EmbeddingEmitter, PacingConfig, Sleeper};
use crate::entities::EntityExtractor;
use crate::error::{RagError, Result};
use crate::loader::{DocumentLoader, SourceDocument};
use crate::manifest::CollectionManifest;
use crate::store::VectorStore;
use crate::writer::VectorIndexWriter;

/// Configuration for one ingestion run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Chunk size, floor and overlap.
    pub chunking: ChunkerConfig,
    /// Texts per embedding request.
    pub embedding_batch_size: usize,
    /// Embedding model recorded in the collection manifest.
    pub embedding_model: String,
    /// Records per store write.
    pub write_batch_size: usize,
    /// Delays and retries around embedding requests.
    pub pacing: PacingConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkerConfig::default(),
            embedding_batch_size: 50,
            embedding_model: "text-embedding-3-small".to_string(),
            write_batch_size: 128,
            pacing: PacingConfig::default(),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Documents loaded.
    pub documents: usize,
    /// Chunks embedded and written.
    pub chunks_written: usize,
    /// Embedding requests issued (excluding retries).
    pub batches: usize,
    /// Documents chunked as plain text because their markdown was malformed.
    pub parse_fallbacks: usize,
}

/// Rebuilds a collection from a directory of markdown sources.
///
/// Runs are all-or-nothing: any fatal error stops the run before the
/// collection is reset.
pub struct IngestPipeline {
    config: IngestConfig,
    loader: DocumentLoader,
    chunker: MarkdownChunker,
    extractor: EntityExtractor,
    emitter: EmbeddingEmitter,
    writer: VectorIndexWriter,
}

impl IngestPipeline {
    /// Wires the pipeline. Fails on an invalid chunking config or when the
    /// embedder does not serve `config.embedding_model`.
    pub fn new(
        config: IngestConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        if embedder.model() != config.embedding_model {
            return Err(RagError::config(format!(
                "embedder serves {} but ingestion is configured for {}",
                embedder.model(),
                config.embedding_model
            )));
        }
        if config.embedding_batch_size == 0 || config.write_batch_size == 0 {
            return Err(RagError::config("batch sizes must be positive"));
        }
        let chunker = MarkdownChunker::new(config.chunking)?;
        let emitter = EmbeddingEmitter::new(embedder, config.embedding_batch_size, config.pacing);
        let writer = VectorIndexWriter::new(store, config.write_batch_size);
        Ok(Self {
            config,
            loader: DocumentLoader::default(),
            chunker,
            extractor: EntityExtractor::default(),
            emitter,
            writer,
        })
    }

    /// Replaces the delay source used between embedding batches.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.emitter = self.emitter.with_sleeper(sleeper);
        self
    }

    /// Replaces the entity extractor.
    pub fn with_extractor(mut self, extractor: EntityExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Replaces the source loader.
    pub fn with_loader(mut self, loader: DocumentLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Loads `source_dir` and rebuilds `collection` from it.
    pub fn run(&self, source_dir: &Path, collection: &str) -> Result<IngestReport> {
        let documents = self.loader.load_dir(source_dir)?;
        if documents.is_empty() {
            return Err(RagError::config(format!(
                "no source documents found under {}",
                source_dir.display()
            )));
        }
        info!(
            dir = %source_dir.display(),
            documents = documents.len(),
            "loaded source documents"
        );
        self.run_documents(&documents, collection)
    }

    /// Rebuilds `collection` from already-loaded documents.
    pub fn run_documents(
        &self,
        documents: &[SourceDocument],
        collection: &str,
    ) -> Result<IngestReport> {
        let started = Instant::now();
        let mut parse_fallbacks = 0;
        let mut chunks: Vec<(usize, Chunk)> = Vec::new();
        for (doc_idx, document) in documents.iter().enumerate() {
            let chunked = self.chunker.chunk(document);
            if chunked.fallback.is_some() {
                parse_fallbacks += 1;
            }
            let mut doc_chunks = chunked.chunks;
            self.extractor.enrich(&mut doc_chunks);
            chunks.extend(doc_chunks.into_iter().map(|chunk| (doc_idx, chunk)));
        }
        if chunks.is_empty() {
            warn!(collection, "no chunks produced; collection will be empty");
        }
        info!(
            collection,
            chunks = chunks.len(),
            parse_fallbacks,
            "chunked sources"
        );

        let texts: Vec<String> = chunks
            .iter()
            .map(|(_, chunk)| chunk.embedding_text())
            .collect();
        let vectors = self.emitter.embed_texts(&texts)?;
        let records: Vec<EmbeddingRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|((doc_idx, chunk), vector)| {
                EmbeddingRecord::from_chunk(chunk, &documents[*doc_idx], vector)
            })
            .collect();

        let manifest = CollectionManifest::new(
            collection,
            self.config.embedding_model.clone(),
            None,
            &self.config.chunking,
        );
        let chunks_written = self.writer.write(collection, &manifest, records)?;
        let report = IngestReport {
            documents: documents.len(),
            chunks_written,
            batches: self.emitter.batch_count(texts.len()),
            parse_fallbacks,
        };
        info!(
            collection,
            documents = report.documents,
            chunks = report.chunks_written,
            batches = report.batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingestion complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::error::EmbedError;
    use crate::metadata::{keys, Primitive};
    use crate::store::LocalVectorStore;

    struct LengthEmbedder {
        model: String,
    }

    impl Embedder for LengthEmbedder {
        fn model(&self) -> &str {
            &self.model
        }

        fn embed_batch(&self, inputs: &[&str]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
            Ok(inputs
                .iter()
                .map(|text| vec![text.len() as f32, 1.0, 0.5])
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn pipeline(store: Arc<LocalVectorStore>, sleeper: Arc<RecordingSleeper>) -> IngestPipeline {
        let config = IngestConfig {
            chunking: ChunkerConfig {
                max_chunk_size: 500,
                min_chunk_size: 10,
                chunk_overlap: 50,
            },
            embedding_batch_size: 2,
            embedding_model: "length-v1".into(),
            ..IngestConfig::default()
        };
        let embedder = Arc::new(LengthEmbedder {
            model: "length-v1".into(),
        });
        IngestPipeline::new(config, embedder, store)
            .unwrap()
            .with_sleeper(sleeper)
    }

    #[test]
    fn single_document_yields_one_enriched_chunk() {
        let store = Arc::new(LocalVectorStore::in_memory());
        let sleeper = Arc::new(RecordingSleeper::default());
        let docs = vec![SourceDocument::new(
            "resume.md",
            "# Experience\n## Oxy\nWorked on IoT systems 2019-2021.",
        )];
        let report = pipeline(store.clone(), sleeper.clone())
            .run_documents(&docs, "portfolio")
            .unwrap();
        assert_eq!(
            report,
            IngestReport {
                documents: 1,
                chunks_written: 1,
                batches: 1,
                parse_fallbacks: 0,
            }
        );
        assert!(sleeper.0.lock().unwrap().is_empty());

        let hits = store.query("portfolio", &[1.0, 0.0, 0.0], 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        let metadata = &hits[0].metadata;
        assert_eq!(
            metadata.get(keys::HEADING_PATH),
            Some(&Primitive::from("Experience > Oxy"))
        );
        assert_eq!(metadata.get("dates"), Some(&Primitive::from("2019-2021")));
        let manifest = store.manifest("portfolio").unwrap().unwrap();
        assert_eq!(manifest.embedding_model, "length-v1");
        assert_eq!(manifest.dimensions, Some(3));
    }

    #[test]
    fn malformed_document_is_counted_and_others_still_ingest() {
        let store = Arc::new(LocalVectorStore::in_memory());
        let sleeper = Arc::new(RecordingSleeper::default());
        let docs = vec![
            SourceDocument::new("broken.md", "# Notes\n```rust\nfn main() {}\n"),
            SourceDocument::new("ok.md", "# Skills\nRust and Python."),
            SourceDocument::new("more.md", "# Projects\nBuilt a crawler."),
        ];
        let report = pipeline(store.clone(), sleeper.clone())
            .run_documents(&docs, "portfolio")
            .unwrap();
        assert_eq!(report.parse_fallbacks, 1);
        assert_eq!(report.chunks_written, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(sleeper.0.lock().unwrap().len(), 1);
        assert_eq!(store.count("portfolio").unwrap(), 3);
    }

    #[test]
    fn rejects_embedder_model_mismatch() {
        let store = Arc::new(LocalVectorStore::in_memory());
        let embedder = Arc::new(LengthEmbedder {
            model: "other".into(),
        });
        let err = IngestPipeline::new(IngestConfig::default(), embedder, store)
            .err()
            .unwrap();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn empty_source_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalVectorStore::in_memory());
        let err = pipeline(store.clone(), Arc::new(RecordingSleeper::default()))
            .run(dir.path(), "portfolio")
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
        assert!(store.manifest("portfolio").unwrap().is_none());
    }
}
