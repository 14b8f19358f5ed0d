//! Query-time retrieval: classify, embed, search, threshold.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::classifier::{Intent, QueryClassifier};
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::manifest::CollectionManifest;
use crate::metadata::{keys, Metadata, MetadataFilter, Primitive};
use crate::policy::RetrievalPolicy;
use crate::store::{StoreHit, VectorStore};

/// A classified query with its retrieval parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    /// Text as asked.
    pub text: String,
    /// Classified intent.
    pub intent: Intent,
    /// Maximum number of results.
    pub top_k: usize,
    /// Minimum similarity a result must reach.
    pub min_similarity: f32,
    /// Text sent to the embedder (the query plus any expansion terms).
    pub embedding_text: String,
}

impl Query {
    /// Overrides the similarity threshold.
    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    /// Overrides the result limit.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }
}

/// One retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    /// Record identifier.
    pub id: String,
    /// Chunk text.
    pub text: String,
    /// Source document, when recorded.
    pub source_document: Option<String>,
    /// Chunk index within the source document, when recorded.
    pub chunk_index: Option<i64>,
    /// Rendered heading path, when recorded.
    pub heading_path: Option<String>,
    /// Similarity in `[0, 1]`.
    pub score: f32,
    /// Full flattened metadata.
    pub metadata: Metadata,
}

impl RetrievedChunk {
    fn from_hit(hit: StoreHit) -> Self {
        let text_field = |key: &str| {
            hit.metadata
                .get(key)
                .and_then(Primitive::as_str)
                .map(str::to_string)
        };
        let source_document = text_field(keys::SOURCE_DOCUMENT);
        let heading_path = text_field(keys::HEADING_PATH).filter(|path| !path.is_empty());
        let chunk_index = hit.metadata.get(keys::CHUNK_INDEX).and_then(Primitive::as_i64);
        Self {
            score: similarity_from_distance(hit.distance),
            id: hit.id,
            text: hit.document_text,
            source_document,
            chunk_index,
            heading_path,
            metadata: hit.metadata,
        }
    }
}

/// Results for one query. An empty hit list is a valid outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    /// The query as classified.
    pub query: Query,
    /// Number of candidates fetched before thresholding.
    pub candidates: usize,
    /// Hits ordered by descending score.
    pub hits: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    /// True when no chunk cleared the threshold.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Maps cosine distance to a similarity in `[0, 1]`.
pub fn similarity_from_distance(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Drops hits below `min_similarity`, orders by descending score and truncates.
///
/// Sorting is stable, so equal scores keep the store's order.
pub fn apply_cutoff(
    mut hits: Vec<RetrievedChunk>,
    min_similarity: f32,
    top_k: usize,
) -> Vec<RetrievedChunk> {
    hits.retain(|hit| hit.score >= min_similarity);
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits.truncate(top_k);
    hits
}

/// Answers queries against one collection.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    collection: String,
    policy: RetrievalPolicy,
    classifier: QueryClassifier,
}

impl Retriever {
    /// Builds a retriever; the classifier comes from the policy's rules.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        policy: RetrievalPolicy,
    ) -> Self {
        let classifier = policy.classifier();
        Self {
            embedder,
            store,
            collection: collection.into(),
            policy,
            classifier,
        }
    }

    /// Collection being searched.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Policy in use.
    pub fn policy(&self) -> &RetrievalPolicy {
        &self.policy
    }

    /// Embedding model used for queries.
    pub fn embedding_model(&self) -> &str {
        self.embedder.model()
    }

    /// Classifies a query without touching the store.
    pub fn classify(&self, text: &str) -> Intent {
        self.classifier.classify(text)
    }

    /// Classifies `text` and attaches the intent's parameters.
    pub fn prepare(&self, text: &str) -> Query {
        let intent = self.classifier.classify(text);
        let params = self.policy.params(intent);
        let embedding_text = match (&params.expansion, self.policy.expand_queries) {
            (Some(expansion), true) if !expansion.trim().is_empty() => {
                format!("{} {}", text.trim(), expansion.trim())
            }
            _ => text.trim().to_string(),
        };
        Query {
            text: text.to_string(),
            intent,
            top_k: params.top_k,
            min_similarity: params.min_similarity,
            embedding_text,
        }
    }

    /// Classifies, embeds and searches in one call.
    pub fn retrieve(&self, text: &str) -> Result<RetrievalResult> {
        self.retrieve_query(self.prepare(text), None)
    }

    /// Embeds a prepared query and searches with an optional metadata filter.
    pub fn retrieve_query(
        &self,
        query: Query,
        filter: Option<&MetadataFilter>,
    ) -> Result<RetrievalResult> {
        let manifest = self.checked_manifest(None)?;
        let vector = self.embed(&query)?;
        manifest.ensure_compatible(self.embedder.model(), Some(vector.len()))?;
        self.search_unchecked(query, &vector, filter)
    }

    /// Embeds a prepared query.
    pub fn embed(&self, query: &Query) -> Result<Vec<f32>> {
        Ok(self.embedder.embed_one(&query.embedding_text)?)
    }

    /// Searches with a precomputed query vector (for callers that cache embeddings).
    pub fn search(
        &self,
        query: Query,
        vector: &[f32],
        filter: Option<&MetadataFilter>,
    ) -> Result<RetrievalResult> {
        self.checked_manifest(Some(vector.len()))?;
        self.search_unchecked(query, vector, filter)
    }

    /// Verifies the collection exists and was built in the query embedding space.
    pub fn checked_manifest(&self, dimensions: Option<usize>) -> Result<CollectionManifest> {
        let manifest = self
            .store
            .manifest(&self.collection)?
            .ok_or_else(|| RagError::CollectionNotFound(self.collection.clone()))?;
        manifest.ensure_compatible(self.embedder.model(), dimensions)?;
        Ok(manifest)
    }

    fn search_unchecked(
        &self,
        query: Query,
        vector: &[f32],
        filter: Option<&MetadataFilter>,
    ) -> Result<RetrievalResult> {
        let candidates = self.policy.candidate_count(query.top_k);
        let raw = self
            .store
            .query(&self.collection, vector, candidates, filter)?;
        let fetched = raw.len();
        let hits = apply_cutoff(
            raw.into_iter().map(RetrievedChunk::from_hit).collect(),
            query.min_similarity,
            query.top_k,
        );
        debug!(
            intent = %query.intent,
            fetched,
            kept = hits.len(),
            min_similarity = query.min_similarity,
            "scored candidates"
        );
        info!(
            collection = %self.collection,
            intent = %query.intent,
            hits = hits.len(),
            "retrieved context"
        );
        Ok(RetrievalResult {
            query,
            candidates: fetched,
            hits,
        })
    }
}
