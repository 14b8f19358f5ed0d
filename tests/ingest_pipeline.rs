mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{write_portfolio, VocabularyEmbedder};
use portfolio_rag::emitter::Sleeper;
use portfolio_rag::metadata::keys;
use portfolio_rag::{
    ChunkerConfig, CollectionManifest, IngestConfig, IngestPipeline, Intent, LocalVectorStore, PacingConfig,
    Primitive, RagError, RetrievalPolicy, Retriever, VectorStore,
};

#[derive(Default)]
struct RecordingSleeper(Mutex<Vec<Duration>>);

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.0.lock().unwrap().push(duration);
    }
}

fn config() -> IngestConfig {
    IngestConfig {
        chunking: ChunkerConfig {
            max_chunk_size: 400,
            min_chunk_size: 10,
            chunk_overlap: 40,
        },
        embedding_batch_size: 2,
        embedding_model: "vocab-v1".into(),
        write_batch_size: 3,
        pacing: PacingConfig {
            throttle_delay: Duration::from_millis(250),
            ..PacingConfig::default()
        },
    }
}

fn ingest(store: Arc<dyn VectorStore>, source: &std::path::Path) -> portfolio_rag::IngestReport {
    let sleeper = Arc::new(RecordingSleeper::default());
    let pipeline = IngestPipeline::new(config(), Arc::new(VocabularyEmbedder::new("vocab-v1")), store)
        .unwrap()
        .with_sleeper(sleeper.clone());
    let report = pipeline.run(source, "portfolio").unwrap();
    assert_eq!(
        sleeper.0.lock().unwrap().len(),
        report.batches.saturating_sub(1)
    );
    report
}

#[test]
fn ingests_directory_and_answers_skills_query_after_reopen() {
    let source = tempfile::tempdir().unwrap();
    write_portfolio(source.path());
    let store_dir = tempfile::tempdir().unwrap();

    let report = {
        let store = Arc::new(LocalVectorStore::open(store_dir.path()).unwrap());
        ingest(store, source.path())
    };
    assert_eq!(report.documents, 2);
    assert_eq!(report.parse_fallbacks, 0);
    assert!(report.chunks_written >= 4);
    assert_eq!(report.batches, report.chunks_written.div_ceil(2));

    let store: Arc<dyn VectorStore> = Arc::new(LocalVectorStore::open(store_dir.path()).unwrap());
    assert_eq!(store.count("portfolio").unwrap(), report.chunks_written);

    let retriever = Retriever::new(
        Arc::new(VocabularyEmbedder::new("vocab-v1")),
        store,
        "portfolio",
        RetrievalPolicy::default(),
    );
    let result = retriever
        .retrieve("What programming languages are in your skills?")
        .unwrap();
    assert_eq!(result.query.intent, Intent::Skills);
    assert!(!result.hits.is_empty());
    let top = &result.hits[0];
    assert_eq!(top.heading_path.as_deref(), Some("Jane Doe > Skills"));
    assert_eq!(top.source_document.as_deref(), Some("resume.md"));
    assert_eq!(
        top.metadata.get("skills").and_then(Primitive::as_str).map(|s| s.contains("Rust")),
        Some(true)
    );
    assert!(result
        .hits
        .iter()
        .all(|hit| hit.score >= result.query.min_similarity));
}

#[test]
fn stored_metadata_is_flat_and_carries_entities() {
    let source = tempfile::tempdir().unwrap();
    write_portfolio(source.path());
    let store = Arc::new(LocalVectorStore::in_memory());
    ingest(store.clone(), source.path());

    let embedder = VocabularyEmbedder::new("vocab-v1");
    let hits = store
        .query("portfolio", &embedder.vector("houston energy engineer"), 1, None)
        .unwrap();
    let metadata = &hits[0].metadata;
    assert_eq!(
        metadata.get(keys::HEADING_PATH),
        Some(&Primitive::from("Jane Doe > Experience > Enchanted Rock"))
    );
    assert_eq!(metadata.get("dates"), Some(&Primitive::from("2019-2021")));
    let locations = metadata.get("locations").and_then(Primitive::as_str).unwrap();
    assert!(locations.split("; ").any(|loc| loc == "Houston, TX"));
    assert!(metadata.get(keys::CHAR_START).and_then(Primitive::as_i64).is_some());
}

#[test]
fn rerun_replaces_collection_instead_of_appending() {
    let source = tempfile::tempdir().unwrap();
    write_portfolio(source.path());
    let store = Arc::new(LocalVectorStore::in_memory());
    let first = ingest(store.clone(), source.path());
    let second = ingest(store.clone(), source.path());
    assert_eq!(first.chunks_written, second.chunks_written);
    assert_eq!(store.count("portfolio").unwrap(), second.chunks_written);
}

#[test]
fn querying_with_another_model_is_rejected() {
    let source = tempfile::tempdir().unwrap();
    write_portfolio(source.path());
    let store = Arc::new(LocalVectorStore::in_memory());
    ingest(store.clone(), source.path());

    let retriever = Retriever::new(
        Arc::new(VocabularyEmbedder::new("vocab-v2")),
        store,
        "portfolio",
        RetrievalPolicy::default(),
    );
    let err = retriever.retrieve("What are your skills?").unwrap_err();
    assert!(matches!(err, RagError::EmbeddingSpaceMismatch { .. }));
}

#[test]
fn off_topic_query_returns_empty_result() {
    let source = tempfile::tempdir().unwrap();
    write_portfolio(source.path());
    let store = Arc::new(LocalVectorStore::in_memory());
    ingest(store.clone(), source.path());

    let retriever = Retriever::new(
        Arc::new(VocabularyEmbedder::new("vocab-v1")),
        store,
        "portfolio",
        RetrievalPolicy::default(),
    );
    let result = retriever.retrieve("What is the weather today?").unwrap();
    assert_eq!(result.query.intent, Intent::General);
    assert!(result.is_empty());
}

#[test]
fn reset_collection_without_records_retrieves_nothing() {
    let store_dir = tempfile::tempdir().unwrap();
    {
        let store = LocalVectorStore::open(store_dir.path()).unwrap();
        let manifest = CollectionManifest::new("portfolio", "vocab-v1", None, &config().chunking);
        store.reset_collection("portfolio", &manifest).unwrap();
    }

    let store: Arc<dyn VectorStore> = Arc::new(LocalVectorStore::open(store_dir.path()).unwrap());
    assert_eq!(store.count("portfolio").unwrap(), 0);
    let retriever = Retriever::new(
        Arc::new(VocabularyEmbedder::new("vocab-v1")),
        store,
        "portfolio",
        RetrievalPolicy::default(),
    );
    let result = retriever.retrieve("What are your skills?").unwrap();
    assert_eq!(result.query.intent, Intent::Skills);
    assert!(result.is_empty());
}
