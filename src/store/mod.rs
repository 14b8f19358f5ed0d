//! Vector store abstraction and its backends.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::manifest::CollectionManifest;
use crate::metadata::{Metadata, MetadataFilter};

pub mod local;
pub mod pgvector;

pub use local::LocalVectorStore;
pub use pgvector::{PgVectorStore, TableName};

/// Row written to a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Collection-unique identifier.
    pub id: String,
    /// Chunk text.
    pub document_text: String,
    /// Flattened metadata.
    pub metadata: Metadata,
    /// Embedding vector.
    pub vector: Vec<f32>,
}

/// Nearest-neighbour result.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHit {
    /// Record identifier.
    pub id: String,
    /// Chunk text.
    pub document_text: String,
    /// Flattened metadata.
    pub metadata: Metadata,
    /// Cosine distance to the query vector (0 = identical direction).
    pub distance: f32,
}

/// Persistent collection of records searchable by cosine distance.
///
/// Results come back ordered by ascending distance; ties keep insertion order.
pub trait VectorStore: Send + Sync {
    /// Drops any existing collection with this name and creates an empty one.
    fn reset_collection(
        &self,
        collection: &str,
        manifest: &CollectionManifest,
    ) -> Result<(), StoreError>;

    /// Appends records to an existing collection.
    fn add(&self, collection: &str, records: &[StoredRecord]) -> Result<(), StoreError>;

    /// Returns up to `k` nearest records, optionally filtered by metadata.
    fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<StoreHit>, StoreError>;

    /// Manifest of the collection, or `None` when it does not exist.
    fn manifest(&self, collection: &str) -> Result<Option<CollectionManifest>, StoreError>;

    /// Number of records in the collection.
    fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// Largest batch accepted by a single [`VectorStore::add`] call.
    fn max_batch_size(&self) -> usize;
}

/// Cosine distance in `[0, 2]`; zero-norm vectors are treated as orthogonal.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}
