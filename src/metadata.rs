//! Store-compatible metadata values and the flattening rules that produce them.
//!
//! Vector stores accept only flat mappings of scalars. Chunk metadata is built
//! as loosely-typed JSON ([`RawMetadata`]) and must pass through
//! [`Primitive::coerce`] before it is written; anything that cannot be
//! represented is rejected rather than silently dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoercionError;

/// Separator used when a list of values is flattened into one string.
pub const LIST_DELIMITER: &str = "; ";

/// Separator used when rendering a heading path.
pub const HEADING_PATH_SEPARATOR: &str = " > ";

/// Loosely-typed metadata assembled during ingestion.
pub type RawMetadata = BTreeMap<String, Value>;

/// Flat metadata accepted by every vector store.
pub type Metadata = BTreeMap<String, Primitive>;

/// Well-known metadata keys written for every chunk.
pub mod keys {
    /// Source document identifier.
    pub const SOURCE_DOCUMENT: &str = "source_document";
    /// Chunk sequence index within its document.
    pub const CHUNK_INDEX: &str = "chunk_index";
    /// Heading path joined with [`super::HEADING_PATH_SEPARATOR`].
    pub const HEADING_PATH: &str = "heading_path";
    /// Inferred document title.
    pub const TITLE: &str = "title";
    /// Byte offset where the chunk starts.
    pub const CHAR_START: &str = "char_start";
    /// Exclusive byte offset where the chunk ends.
    pub const CHAR_END: &str = "char_end";
    /// CRC32 of the source document.
    pub const SOURCE_CHECKSUM: &str = "source_checksum";
}

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    /// Boolean flag.
    Bool(bool),
    /// Integral number.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text, including flattened lists.
    Text(String),
}

impl Primitive {
    /// Validates a raw value and converts it into a storable primitive.
    ///
    /// Lists of scalars are joined with [`LIST_DELIMITER`]; `null`, mappings,
    /// nested lists and list items that would not survive a split are errors.
    pub fn coerce(value: &Value) -> Result<Self, CoercionError> {
        match value {
            Value::Null => Err(CoercionError::Null),
            Value::Bool(flag) => Ok(Self::Bool(*flag)),
            Value::Number(number) => Ok(match number.as_i64() {
                Some(int) => Self::Int(int),
                None => Self::Float(number.as_f64().unwrap_or_default()),
            }),
            Value::String(text) => Ok(Self::Text(text.clone())),
            Value::Array(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    let part = match item {
                        Value::String(text) => text.clone(),
                        Value::Number(number) => number.to_string(),
                        Value::Bool(flag) => flag.to_string(),
                        Value::Null | Value::Array(_) | Value::Object(_) => {
                            return Err(CoercionError::NestedList)
                        }
                    };
                    if part.is_empty() {
                        return Err(CoercionError::EmptyListItem);
                    }
                    if part.contains(LIST_DELIMITER) {
                        return Err(CoercionError::DelimiterInListItem(part));
                    }
                    parts.push(part);
                }
                Ok(Self::Text(parts.join(LIST_DELIMITER)))
            }
            Value::Object(_) => Err(CoercionError::Mapping),
        }
    }

    /// Returns the text payload when this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the integral payload when this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(int) => Some(*int),
            _ => None,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Int(int) => write!(f, "{int}"),
            Self::Float(float) => write!(f, "{float}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for Primitive {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Primitive {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Primitive {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Primitive {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Coerces every entry of a raw metadata map, reporting the first bad key.
pub fn coerce_metadata(raw: &RawMetadata) -> Result<Metadata, (String, CoercionError)> {
    let mut flat = Metadata::new();
    for (key, value) in raw {
        let primitive = Primitive::coerce(value).map_err(|err| (key.clone(), err))?;
        flat.insert(key.clone(), primitive);
    }
    Ok(flat)
}

/// Joins list values the same way [`Primitive::coerce`] does.
pub fn flatten_list<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|value| value.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(LIST_DELIMITER)
}

/// Splits a flattened list back into its values.
pub fn split_flattened(flat: &str) -> BTreeSet<String> {
    if flat.is_empty() {
        return BTreeSet::new();
    }
    flat.split(LIST_DELIMITER).map(str::to_string).collect()
}

/// Predicate evaluated against stored metadata at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataFilter {
    /// The key holds exactly this value.
    Equals {
        /// Metadata key.
        key: String,
        /// Expected value.
        value: Primitive,
    },
    /// The key holds a flattened list that contains this item.
    Contains {
        /// Metadata key.
        key: String,
        /// Expected list item.
        value: String,
    },
    /// Every nested filter matches.
    All {
        /// Nested filters.
        filters: Vec<MetadataFilter>,
    },
}

impl MetadataFilter {
    /// Evaluates the filter against one record's metadata.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Self::Equals { key, value } => metadata.get(key) == Some(value),
            Self::Contains { key, value } => metadata
                .get(key)
                .and_then(Primitive::as_str)
                .map(|flat| flat.split(LIST_DELIMITER).any(|item| item == value))
                .unwrap_or(false),
            Self::All { filters } => filters.iter().all(|filter| filter.matches(metadata)),
        }
    }
}
