//! Source document discovery for ingestion runs.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{RagError, Result};

/// File extensions picked up by default.
pub const DEFAULT_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

/// One markdown source file read from the source directory.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    /// Stable identifier: the path relative to the source directory, `/`-separated.
    pub id: String,
    /// Absolute or caller-relative path the text was read from.
    pub path: PathBuf,
    /// Full text content.
    pub text: String,
    /// First level-1 heading, falling back to the file stem.
    pub title: String,
    /// CRC32 checksum of the raw file bytes.
    pub checksum: u32,
    /// True when the file required lossy UTF-8 decoding.
    pub lossy_decoding: bool,
}

impl SourceDocument {
    /// Builds a document from in-memory text (used by tests and API callers).
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        let text = text.into();
        let title = infer_title(&text).unwrap_or_else(|| stem_of(&id));
        let checksum = checksum(text.as_bytes());
        Self {
            path: PathBuf::from(&id),
            id,
            text,
            title,
            checksum,
            lossy_decoding: false,
        }
    }

    fn from_bytes(id: String, path: PathBuf, bytes: &[u8]) -> Self {
        let (decoded, lossy_decoding) = decode_body(bytes);
        let text = decoded.into_owned();
        let title = infer_title(&text).unwrap_or_else(|| stem_of(&id));
        Self {
            id,
            path,
            text,
            title,
            checksum: checksum(bytes),
            lossy_decoding,
        }
    }
}

/// Walks a directory and reads every markdown file beneath it.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    extensions: Vec<String>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect())
    }
}

impl DocumentLoader {
    /// Builds a loader that accepts the given extensions (case-insensitive, without dots).
    pub fn new(extensions: Vec<String>) -> Self {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Loads every matching file in `dir`, sorted by relative path.
    ///
    /// Blank files are skipped with a warning. A missing or unreadable
    /// directory is an error.
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<SourceDocument>> {
        let metadata = fs::metadata(dir).map_err(|source| RagError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(RagError::config(format!(
                "source path {} is not a directory",
                dir.display()
            )));
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                let path = err.path().unwrap_or(dir).to_path_buf();
                RagError::Io {
                    path,
                    source: err.into(),
                }
            })?;
            if !entry.file_type().is_file() || !self.accepts(entry.path()) {
                continue;
            }

            let path = entry.path().to_path_buf();
            let bytes = fs::read(&path).map_err(|source| RagError::Io {
                path: path.clone(),
                source,
            })?;
            let id = relative_id(dir, &path);
            let document = SourceDocument::from_bytes(id, path, &bytes);
            if document.lossy_decoding {
                warn!(document = %document.id, "source file is not valid UTF-8; decoded lossily");
            }
            if document.text.trim().is_empty() {
                warn!(document = %document.id, "skipping blank source file");
                continue;
            }
            debug!(
                document = %document.id,
                bytes = document.text.len(),
                title = %document.title,
                "loaded source document"
            );
            documents.push(document);
        }
        Ok(documents)
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }
}

fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn infer_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().trim_end_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
}

fn stem_of(id: &str) -> String {
    Path::new(id)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.to_string())
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn decode_body(bytes: &[u8]) -> (Cow<'_, str>, bool) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), false),
        Err(_) => (
            Cow::Owned(String::from_utf8_lossy(bytes).into_owned()),
            true,
        ),
    }
}
