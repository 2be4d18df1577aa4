//! Storage abstraction layer for quiver
//!
//! The vector store keeps its ANN index in memory and persists every record
//! through a [`RecordStore`]. On startup the persisted records are loaded back
//! and the index is rebuilt from them, so the store is the source of truth and
//! the index is derived state.
//!
//! ## Key Components
//!
//! - **RecordStore**: collection and record persistence
//! - **SqliteRecordStore**: SQLite implementation (see [`sqlite_store`])
//! - **Data Types**: record keys, embedding records, collection specs
//!
//! ## Architecture
//!
//! ```text
//! VectorStore ── HnswIndex (in memory, rebuilt on open)
//!      │
//!      └──── RecordStore ── SqliteRecordStore (concrete implementation)
//! ```

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quiver_embed::{ContentHash, DistanceMetric, Modality};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod sqlite_store;

/// Logical key of an embedding record within a collection.
///
/// Chunk records are keyed `"<source_id>#<chunk_index>"`; standalone content
/// is keyed by its content hash. Any other string is accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for chunk `index` of document `source_id`
    pub fn chunk(source_id: &str, index: u32) -> Self {
        Self(format!("{source_id}#{index}"))
    }

    /// Key for standalone content, derived from its content hash
    pub fn content(hash: &ContentHash) -> Self {
        Self(format!("content:{}", hash.to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Scalar metadata value attached to documents and records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Parse a command-line style value: booleans, integers and floats are
    /// recognized, anything else is text.
    pub fn parse(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            Self::Bool(b)
        } else if let Ok(i) = raw.parse::<i64>() {
            Self::Int(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            Self::Float(f)
        } else {
            Self::Text(raw.to_string())
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// String → scalar mapping
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Exact-match metadata filter; every entry must match.
pub type MetadataFilter = BTreeMap<String, MetadataValue>;

pub fn matches_filter(metadata: &Metadata, filter: &MetadataFilter) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

/// One vector plus everything needed to identify and display it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub key: RecordKey,
    pub model: String,
    pub modality: Modality,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    /// Content the vector was computed from (chunk text or content reference)
    pub content: Option<String>,
    /// Source document identifier, for chunk records
    pub source_id: Option<String>,
    pub chunk_index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn new(
        key: impl Into<RecordKey>,
        model: impl Into<String>,
        modality: Modality,
        vector: Vec<f32>,
    ) -> Self {
        Self {
            key: key.into(),
            model: model.into(),
            modality,
            vector,
            metadata: Metadata::new(),
            content: None,
            source_id: None,
            chunk_index: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>, chunk_index: u32) -> Self {
        self.source_id = Some(source_id.into());
        self.chunk_index = Some(chunk_index);
        self
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// A persisted record together with its insertion sequence number.
///
/// The sequence number orders insertions within a collection and breaks
/// similarity ties (most recent first).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: EmbeddingRecord,
    pub seq: u64,
}

/// ANN construction parameters, fixed per collection until an explicit rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexParams {
    /// Neighbor fan-out per node and layer
    pub m: usize,
    /// Candidate list width while inserting
    pub ef_construction: usize,
    /// Candidate list width while querying
    pub ef_search: usize,
    /// Seed for level assignment
    pub seed: u64,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            seed: 42,
        }
    }
}

impl IndexParams {
    pub fn with_m(self, m: usize) -> Self {
        Self { m, ..self }
    }

    pub fn with_ef_construction(self, ef_construction: usize) -> Self {
        Self {
            ef_construction,
            ..self
        }
    }

    pub fn with_ef_search(self, ef_search: usize) -> Self {
        Self { ef_search, ..self }
    }

    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(EngineError::invalid_request("index parameter m must be at least 2"));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(EngineError::invalid_request(
                "index parameters ef_construction and ef_search must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Declaration of a collection, fixed at creation time (apart from index
/// parameters, which change only through a rebuild).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub modality: Modality,
    pub model: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub index_params: IndexParams,
    pub created_at: DateTime<Utc>,
}

/// Persistence for collections and their records.
///
/// Implementations must be durable once a call returns `Ok`. Record upserts
/// are keyed by (collection, record key, model) and must never leave two rows
/// for one key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new collection; `CollectionAlreadyExists` if the name is taken
    async fn create_collection(&self, spec: &CollectionSpec) -> Result<()>;

    /// Load every persisted collection
    async fn load_collections(&self) -> Result<Vec<CollectionSpec>>;

    /// Replace the stored index parameters of a collection
    async fn update_index_params(&self, collection: &str, params: &IndexParams) -> Result<()>;

    /// Insert or replace records, atomically for the whole batch
    async fn upsert_records(&self, collection: &str, records: &[StoredRecord]) -> Result<()>;

    /// Delete records by key, returning how many rows were removed
    async fn delete_records(&self, collection: &str, keys: &[RecordKey]) -> Result<usize>;

    /// Load every record of a collection, in insertion order
    async fn load_records(&self, collection: &str) -> Result<Vec<StoredRecord>>;

    /// Number of persisted records in a collection
    async fn count_records(&self, collection: &str) -> Result<usize>;

    /// Delete a collection and all of its records
    async fn drop_collection(&self, collection: &str) -> Result<()>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<()>;
}
