//! In-process vector store with optional JSON snapshots.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{cosine_distance, StoreHit, StoredRecord, VectorStore};
use crate::error::StoreError;
use crate::manifest::CollectionManifest;
use crate::metadata::MetadataFilter;

const DEFAULT_MAX_BATCH: usize = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalCollection {
    manifest: CollectionManifest,
    records: Vec<StoredRecord>,
}

/// Brute-force cosine search over records held in memory.
///
/// When opened on a directory, every mutation rewrites
/// `<dir>/<collection>.json` so a later process sees the same collection.
#[derive(Debug)]
pub struct LocalVectorStore {
    root: Option<PathBuf>,
    collections: RwLock<HashMap<String, LocalCollection>>,
    max_batch: usize,
}

impl LocalVectorStore {
    /// Creates a store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            collections: RwLock::new(HashMap::new()),
            max_batch: DEFAULT_MAX_BATCH,
        }
    }

    /// Opens (or creates) a snapshot directory and loads every collection in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = dir.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Snapshot {
            path: root.clone(),
            source,
        })?;

        let mut collections = HashMap::new();
        let entries = fs::read_dir(&root).map_err(|source| StoreError::Snapshot {
            path: root.clone(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::Snapshot {
                    path: root.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let file = File::open(&path).map_err(|source| StoreError::Snapshot {
                path: path.clone(),
                source,
            })?;
            let collection: LocalCollection = serde_json::from_reader(BufReader::new(file))?;
            debug!(
                collection = %collection.manifest.collection,
                records = collection.records.len(),
                "loaded snapshot"
            );
            collections.insert(collection.manifest.collection.clone(), collection);
        }
        info!(dir = %root.display(), collections = collections.len(), "opened local vector store");

        Ok(Self {
            root: Some(root),
            collections: RwLock::new(collections),
            max_batch: DEFAULT_MAX_BATCH,
        })
    }

    /// Overrides the per-call batch limit.
    pub fn with_max_batch_size(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, LocalCollection>>, StoreError> {
        self.collections
            .read()
            .map_err(|_| StoreError::Backend("local store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, LocalCollection>>, StoreError> {
        self.collections
            .write()
            .map_err(|_| StoreError::Backend("local store lock poisoned".into()))
    }

    fn persist(&self, collection: &LocalCollection) -> Result<(), StoreError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let path = snapshot_path(root, &collection.manifest.collection);
        let tmp = path.with_extension("json.tmp");
        let io_err = |source| StoreError::Snapshot {
            path: tmp.clone(),
            source,
        };
        let file = File::create(&tmp).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, collection)?;
        writer.flush().map_err(io_err)?;
        drop(writer);
        fs::rename(&tmp, &path).map_err(|source| StoreError::Snapshot {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }
}

fn snapshot_path(root: &Path, collection: &str) -> PathBuf {
    let file_name: String = collection
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    root.join(format!("{file_name}.json"))
}

impl VectorStore for LocalVectorStore {
    fn reset_collection(
        &self,
        collection: &str,
        manifest: &CollectionManifest,
    ) -> Result<(), StoreError> {
        let fresh = LocalCollection {
            manifest: CollectionManifest {
                collection: collection.to_string(),
                ..manifest.clone()
            },
            records: Vec::new(),
        };
        let mut guard = self.write()?;
        self.persist(&fresh)?;
        guard.insert(collection.to_string(), fresh);
        Ok(())
    }

    fn add(&self, collection: &str, records: &[StoredRecord]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        let entry = guard
            .get_mut(collection)
            .ok_or_else(|| StoreError::MissingCollection(collection.to_string()))?;
        for record in records {
            let expected = *entry
                .manifest
                .dimensions
                .get_or_insert(record.vector.len());
            if record.vector.len() != expected {
                return Err(StoreError::Dimension {
                    expected,
                    actual: record.vector.len(),
                });
            }
        }
        entry.records.extend_from_slice(records);
        self.persist(entry)
    }

    fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<StoreHit>, StoreError> {
        let guard = self.read()?;
        let entry = guard
            .get(collection)
            .ok_or_else(|| StoreError::MissingCollection(collection.to_string()))?;
        if let Some(expected) = entry.manifest.dimensions {
            if expected != vector.len() && !entry.records.is_empty() {
                return Err(StoreError::Dimension {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let mut hits: Vec<StoreHit> = entry
            .records
            .iter()
            .filter(|record| filter.map_or(true, |f| f.matches(&record.metadata)))
            .map(|record| StoreHit {
                id: record.id.clone(),
                document_text: record.document_text.clone(),
                metadata: record.metadata.clone(),
                distance: cosine_distance(vector, &record.vector),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    fn manifest(&self, collection: &str) -> Result<Option<CollectionManifest>, StoreError> {
        Ok(self
            .read()?
            .get(collection)
            .map(|entry| entry.manifest.clone()))
    }

    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.read()?
            .get(collection)
            .map(|entry| entry.records.len())
            .ok_or_else(|| StoreError::MissingCollection(collection.to_string()))
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }
}
