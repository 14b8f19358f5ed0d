//! Embedding records handed from the emitter to the index writer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::chunker::Chunk;
use crate::entities::EntityKind;
use crate::loader::SourceDocument;
use crate::metadata::{keys, RawMetadata};

/// A chunk paired with its vector, ready to be written to a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Collection-unique identifier, `{document_id}#{chunk_index}`.
    pub id: String,
    /// Chunk text stored as the record's document.
    pub text: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Uncoerced metadata; flattened by the writer.
    pub metadata: RawMetadata,
}

impl EmbeddingRecord {
    /// Builds the record for `chunk`, collecting its positional and entity metadata.
    pub fn from_chunk(chunk: &Chunk, document: &SourceDocument, vector: Vec<f32>) -> Self {
        let mut metadata = RawMetadata::new();
        metadata.insert(keys::SOURCE_DOCUMENT.into(), json!(chunk.document_id));
        metadata.insert(keys::CHUNK_INDEX.into(), json!(chunk.index));
        metadata.insert(
            keys::HEADING_PATH.into(),
            Value::String(chunk.render_heading_path()),
        );
        metadata.insert(keys::TITLE.into(), json!(document.title));
        metadata.insert(keys::CHAR_START.into(), json!(chunk.char_start));
        metadata.insert(keys::CHAR_END.into(), json!(chunk.char_end));
        metadata.insert(keys::SOURCE_CHECKSUM.into(), json!(document.checksum));
        for kind in EntityKind::ALL {
            let values = chunk
                .entities
                .get(&kind)
                .map(|set| set.iter().cloned().map(Value::String).collect())
                .unwrap_or_default();
            metadata.insert(kind.metadata_key().into(), Value::Array(values));
        }

        Self {
            id: chunk.id(),
            text: chunk.text.clone(),
            vector,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkerConfig, MarkdownChunker};
    use crate::entities::EntityExtractor;

    #[test]
    fn carries_position_and_entities() {
        let doc = SourceDocument::new(
            "resume.md",
            "# Experience\n## Oxy\nBuilt Python pipelines in 2019-2021.",
        );
        let mut chunks = MarkdownChunker::new(ChunkerConfig::default())
            .unwrap()
            .try_chunk(&doc)
            .unwrap();
        EntityExtractor::default().enrich(&mut chunks);

        let record = EmbeddingRecord::from_chunk(&chunks[0], &doc, vec![0.5, 0.5]);
        assert_eq!(record.id, "resume.md#0");
        assert_eq!(record.metadata[keys::HEADING_PATH], json!("Experience > Oxy"));
        assert_eq!(record.metadata[keys::CHUNK_INDEX], json!(0));
        assert_eq!(record.metadata["dates"], json!(["2019-2021"]));
        assert_eq!(record.metadata["skills"], json!(["Python"]));
        assert_eq!(record.metadata["locations"], json!([]));
    }
}
