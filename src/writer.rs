//! Writes embedding records into a freshly reset collection.

use std::sync::Arc;

use tracing::info;

use crate::embeddings::EmbeddingRecord;
use crate::error::{RagError, Result};
use crate::manifest::CollectionManifest;
use crate::metadata::coerce_metadata;
use crate::store::{StoredRecord, VectorStore};

/// Rebuilds a collection from a full set of records.
pub struct VectorIndexWriter {
    store: Arc<dyn VectorStore>,
    write_batch_size: usize,
}

impl VectorIndexWriter {
    /// Builds a writer; the effective batch size never exceeds the store's limit.
    pub fn new(store: Arc<dyn VectorStore>, write_batch_size: usize) -> Self {
        Self {
            store,
            write_batch_size: write_batch_size.max(1),
        }
    }

    /// Batch size used for `add` calls.
    pub fn effective_batch_size(&self) -> usize {
        self.write_batch_size.min(self.store.max_batch_size().max(1))
    }

    /// Replaces the collection's contents with `records`.
    ///
    /// Metadata is coerced for every record before the store is touched, so a
    /// coercion failure leaves the previous collection intact. Returns the
    /// number of records written.
    pub fn write(
        &self,
        collection: &str,
        manifest: &CollectionManifest,
        records: Vec<EmbeddingRecord>,
    ) -> Result<usize> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let metadata = coerce_metadata(&record.metadata).map_err(|(key, reason)| {
                RagError::MetadataCoercion {
                    record_id: record.id.clone(),
                    key,
                    reason,
                }
            })?;
            rows.push(StoredRecord {
                id: record.id,
                document_text: record.text,
                metadata,
                vector: record.vector,
            });
        }

        let mut manifest = manifest.clone();
        if manifest.dimensions.is_none() {
            manifest.dimensions = rows.first().map(|row| row.vector.len());
        }

        self.store.reset_collection(collection, &manifest)?;
        let batch_size = self.effective_batch_size();
        for (batch_idx, batch) in rows.chunks(batch_size).enumerate() {
            self.store.add(collection, batch)?;
            info!(
                collection,
                batch = batch_idx + 1,
                records = batch.len(),
                "wrote batch"
            );
        }
        info!(collection, records = rows.len(), "collection rebuilt");
        Ok(rows.len())
    }
}
