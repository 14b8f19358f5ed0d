//! Collection manifests recording how a collection's vectors were produced.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;
use crate::error::{RagError, Result};

/// Describes the embedding space and chunking of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionManifest {
    /// Collection name.
    pub collection: String,
    /// Embedding model that produced every stored vector.
    pub embedding_model: String,
    /// Vector dimension, unknown until the first vector is produced.
    pub dimensions: Option<usize>,
    /// Max chunk size used at ingestion time.
    pub max_chunk_size: usize,
    /// Chunk overlap used at ingestion time.
    pub chunk_overlap: usize,
    /// Epoch milliseconds when the collection was rebuilt.
    pub created_epoch_ms: u64,
}

impl CollectionManifest {
    /// Creates a manifest stamped with the current time.
    pub fn new(
        collection: impl Into<String>,
        embedding_model: impl Into<String>,
        dimensions: Option<usize>,
        chunking: &ChunkerConfig,
    ) -> Self {
        Self {
            collection: collection.into(),
            embedding_model: embedding_model.into(),
            dimensions,
            max_chunk_size: chunking.max_chunk_size,
            chunk_overlap: chunking.chunk_overlap,
            created_epoch_ms: epoch_ms_now(),
        }
    }

    /// Fails when queries would be embedded in a different space than the collection.
    pub fn ensure_compatible(&self, model: &str, dimensions: Option<usize>) -> Result<()> {
        let dims_conflict = matches!(
            (self.dimensions, dimensions),
            (Some(indexed), Some(query)) if indexed != query
        );
        if self.embedding_model != model || dims_conflict {
            return Err(RagError::EmbeddingSpaceMismatch {
                collection: self.collection.clone(),
                indexed_model: self.embedding_model.clone(),
                indexed_dimensions: self.dimensions,
                query_model: model.to_string(),
                query_dimensions: dimensions,
            });
        }
        Ok(())
    }
}

fn epoch_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_model_and_dimension_mismatch() {
        let manifest = CollectionManifest::new(
            "resume_data",
            "text-embedding-3-small",
            Some(1536),
            &ChunkerConfig::default(),
        );
        assert!(manifest
            .ensure_compatible("text-embedding-3-small", Some(1536))
            .is_ok());
        assert!(manifest.ensure_compatible("text-embedding-3-small", None).is_ok());
        assert!(matches!(
            manifest.ensure_compatible("text-embedding-ada-002", Some(1536)),
            Err(RagError::EmbeddingSpaceMismatch { .. })
        ));
        assert!(matches!(
            manifest.ensure_compatible("text-embedding-3-small", Some(256)),
            Err(RagError::EmbeddingSpaceMismatch { .. })
        ));
    }
}
