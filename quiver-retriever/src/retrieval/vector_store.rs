//! Collection management and similarity search.
//!
//! A [`VectorStore`] owns named collections. Each collection declares one
//! modality and one model at creation time, which fixes its dimensionality
//! and distance metric. Records are persisted through a [`RecordStore`] and
//! indexed in memory by an [`HnswIndex`]; the index is rebuilt from the
//! persisted records when the store is opened.
//!
//! ## Concurrency
//!
//! Writes to a collection are serialized by a per-collection writer lock, so
//! when two inserts race for one key the insert that completes last decides
//! the stored vector. Queries only take the read side of the collection
//! state and see either the state before or after a write, never a partial
//! one. A rebuild constructs the new index off to the side and swaps it in
//! under the write lock.

use super::hnsw::{HnswIndex, Neighbor};
use crate::error::{EngineError, Result};
use crate::storage::{
    CollectionSpec, EmbeddingRecord, IndexParams, Metadata, MetadataFilter, RecordKey,
    RecordStore, StoredRecord, matches_filter,
};
use chrono::{DateTime, Utc};
use quiver_embed::{DistanceMetric, Modality, ModelRegistry};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub key: RecordKey,
    /// Metric-specific similarity, higher is closer
    pub similarity: f32,
    /// Metric-specific distance, lower is closer
    pub distance: f32,
    pub model: String,
    pub modality: Modality,
    pub metadata: Metadata,
    pub content: Option<String>,
    pub source_id: Option<String>,
    pub chunk_index: Option<u32>,
    pub created_at: DateTime<Utc>,
    /// Insertion sequence number within the collection
    pub inserted_seq: u64,
}

impl Hit {
    fn new(neighbor: Neighbor, stored: &StoredRecord) -> Self {
        let record = &stored.record;
        Self {
            key: neighbor.key,
            similarity: neighbor.similarity,
            distance: neighbor.distance,
            model: record.model.clone(),
            modality: record.modality,
            metadata: record.metadata.clone(),
            content: record.content.clone(),
            source_id: record.source_id.clone(),
            chunk_index: record.chunk_index,
            created_at: record.created_at,
            inserted_seq: stored.seq,
        }
    }
}

/// Public description of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub modality: Modality,
    pub model: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub index_params: IndexParams,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
}

/// Runtime statistics of one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub live_records: usize,
    /// Deleted or replaced nodes still present in the graph
    pub tombstones: usize,
    pub index_params: IndexParams,
    pub queries: u64,
    pub records_inserted: u64,
    pub records_deleted: u64,
    pub rebuilds: u64,
    /// Automatic rebuilds that dropped tombstones
    pub compactions: u64,
    pub avg_query_ms: f64,
}

/// Index and metadata agreement for one collection at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencySnapshot {
    pub collection: String,
    pub index_entries: usize,
    pub metadata_rows: usize,
    pub persisted_rows: usize,
    /// Keys with a metadata row but no live index entry
    pub missing_from_index: Vec<RecordKey>,
    /// Keys with a live index entry but no metadata row
    pub missing_from_metadata: Vec<RecordKey>,
}

impl ConsistencySnapshot {
    pub fn is_consistent(&self) -> bool {
        self.index_entries == self.metadata_rows
            && self.metadata_rows == self.persisted_rows
            && self.missing_from_index.is_empty()
            && self.missing_from_metadata.is_empty()
    }
}

struct CollectionState {
    spec: CollectionSpec,
    index: HnswIndex,
    /// Side table: record key -> record, kept in lockstep with `index`
    records: HashMap<RecordKey, StoredRecord>,
    next_seq: u64,
}

impl CollectionState {
    fn info(&self) -> CollectionInfo {
        CollectionInfo {
            name: self.spec.name.clone(),
            modality: self.spec.modality,
            model: self.spec.model.clone(),
            dimension: self.spec.dimension,
            metric: self.spec.metric,
            index_params: self.spec.index_params,
            created_at: self.spec.created_at,
            record_count: self.records.len(),
        }
    }
}

#[derive(Default)]
struct CollectionCounters {
    queries: AtomicU64,
    query_micros: AtomicU64,
    inserted: AtomicU64,
    deleted: AtomicU64,
    rebuilds: AtomicU64,
    compactions: AtomicU64,
}

struct Collection {
    writer: Mutex<()>,
    state: RwLock<CollectionState>,
    counters: CollectionCounters,
}

impl Collection {
    fn new(spec: CollectionSpec, records: Vec<StoredRecord>, index: HnswIndex) -> Self {
        let next_seq = records.iter().map(|r| r.seq + 1).max().unwrap_or(0);
        let records = records
            .into_iter()
            .map(|r| (r.record.key.clone(), r))
            .collect();
        Self {
            writer: Mutex::new(()),
            state: RwLock::new(CollectionState {
                spec,
                index,
                records,
                next_seq,
            }),
            counters: CollectionCounters::default(),
        }
    }
}

/// Collections of embedding records with approximate nearest-neighbour search.
pub struct VectorStore {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn RecordStore>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl VectorStore {
    /// Open a vector store over `store`, reloading every persisted collection
    /// and rebuilding its index.
    ///
    /// # Arguments
    /// * `registry` - Model table used to validate collections and records
    /// * `store` - Persistence backend
    ///
    /// # Errors
    /// `StorageError` if the persisted state cannot be read.
    pub async fn open(registry: Arc<ModelRegistry>, store: Arc<dyn RecordStore>) -> Result<Self> {
        let mut collections = HashMap::new();

        for spec in store.load_collections().await? {
            if !registry.contains(&spec.model) {
                warn!(
                    "Collection {} uses model {} which is not in the registry; inserts will be rejected",
                    spec.name, spec.model
                );
            }
            let records = store.load_records(&spec.name).await?;
            let (metric, dimension, params) = (spec.metric, spec.dimension, spec.index_params);
            let items: Vec<_> = records
                .iter()
                .map(|r| (r.record.key.clone(), r.record.vector.clone(), r.seq))
                .collect();
            let index = build_index(metric, dimension, params, items).await?;

            info!(
                "Loaded collection {} ({} records, model {})",
                spec.name,
                records.len(),
                spec.model
            );
            collections.insert(
                spec.name.clone(),
                Arc::new(Collection::new(spec, records, index)),
            );
        }

        Ok(Self {
            registry,
            store,
            collections: RwLock::new(collections),
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn record_store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    async fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::collection_not_found(name))
    }

    /// Fails with `CollectionNotFound` when `handle` is no longer the
    /// collection registered under `name`, i.e. it was dropped (and perhaps
    /// recreated) while the caller waited for its writer lock.
    async fn ensure_current(&self, name: &str, handle: &Arc<Collection>) -> Result<()> {
        match self.collections.read().await.get(name) {
            Some(current) if Arc::ptr_eq(current, handle) => Ok(()),
            _ => Err(EngineError::collection_not_found(name)),
        }
    }

    /// Create an empty collection bound to one modality and one model.
    ///
    /// # Errors
    /// - `CollectionAlreadyExists` if the name is taken
    /// - `UnknownModel` if the model is not registered
    /// - `InvalidRequest` for an empty name, bad index parameters, or a model
    ///   that does not accept the modality
    pub async fn create_collection(
        &self,
        name: &str,
        modality: Modality,
        model: &str,
        params: IndexParams,
    ) -> Result<CollectionInfo> {
        if name.trim().is_empty() {
            return Err(EngineError::invalid_request("collection name must not be empty"));
        }
        params.validate()?;
        let model_spec = self.registry.resolve(model)?;
        if !model_spec.supports(modality) {
            return Err(EngineError::invalid_request(format!(
                "model {model} does not accept {modality} content"
            )));
        }
        if self.collections.read().await.contains_key(name) {
            return Err(EngineError::CollectionAlreadyExists {
                name: name.to_string(),
            });
        }

        let spec = CollectionSpec {
            name: name.to_string(),
            modality,
            model: model.to_string(),
            dimension: model_spec.dimension,
            metric: model_spec.metric,
            index_params: params,
            created_at: Utc::now(),
        };
        // the store's unique constraint settles concurrent creates of one name
        self.store.create_collection(&spec).await?;

        let index = HnswIndex::new(spec.metric, spec.dimension, params);
        let collection = Arc::new(Collection::new(spec, Vec::new(), index));
        let info = collection.state.read().await.info();
        self.collections
            .write()
            .await
            .insert(name.to_string(), collection);

        info!(
            "Created collection {} ({}, model {}, dim {}, {})",
            name, modality, model, info.dimension, info.metric
        );
        Ok(info)
    }

    /// Upsert records into a collection.
    ///
    /// The whole batch is validated before anything is written. Within one
    /// batch the last record for a key wins. An existing record with the same
    /// key is replaced in both the index and the metadata table.
    ///
    /// # Returns
    /// Number of distinct records written
    ///
    /// # Errors
    /// `CollectionNotFound`, `ModelMismatch`, `ModalityMismatch`,
    /// `DimensionMismatch`, `InvalidRequest` (non-finite components) or
    /// `StorageError`.
    pub async fn insert(&self, collection: &str, records: Vec<EmbeddingRecord>) -> Result<usize> {
        let handle = self.collection(collection).await?;
        {
            let state = handle.state.read().await;
            for record in &records {
                self.validate_record(&state.spec, record)?;
            }
        }
        if records.is_empty() {
            return Ok(0);
        }
        let records = dedupe_last_wins(records);

        let _writer = handle.writer.lock().await;
        self.ensure_current(collection, &handle).await?;
        let first_seq = handle.state.read().await.next_seq;
        let stored: Vec<StoredRecord> = records
            .into_iter()
            .zip(first_seq..)
            .map(|(record, seq)| StoredRecord { record, seq })
            .collect();

        self.store.upsert_records(collection, &stored).await?;

        let count = stored.len();
        {
            let mut state = handle.state.write().await;
            for entry in stored {
                state
                    .index
                    .insert(entry.record.key.clone(), &entry.record.vector, entry.seq);
                state.records.insert(entry.record.key.clone(), entry);
            }
            state.next_seq = first_seq + count as u64;
        }
        handle
            .counters
            .inserted
            .fetch_add(count as u64, Ordering::Relaxed);
        self.compact_if_needed(collection, &handle).await;

        debug!("Inserted {} records into {}", count, collection);
        Ok(count)
    }

    fn validate_record(&self, spec: &CollectionSpec, record: &EmbeddingRecord) -> Result<()> {
        if record.model != spec.model {
            return Err(EngineError::ModelMismatch {
                collection: spec.name.clone(),
                expected: spec.model.clone(),
                actual: record.model.clone(),
            });
        }
        if record.modality != spec.modality {
            return Err(EngineError::ModalityMismatch {
                collection: spec.name.clone(),
                expected: spec.modality,
                actual: record.modality,
            });
        }
        self.registry.validate_vector(&record.model, &record.vector)?;
        if record.vector.len() != spec.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: spec.dimension,
                actual: record.vector.len(),
            });
        }
        if record.vector.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::invalid_request(format!(
                "record {} has non-finite vector components",
                record.key
            )));
        }
        Ok(())
    }

    /// Delete records by key. Unknown keys are ignored.
    ///
    /// # Returns
    /// Number of records removed
    pub async fn delete(&self, collection: &str, keys: &[RecordKey]) -> Result<usize> {
        let handle = self.collection(collection).await?;
        let _writer = handle.writer.lock().await;
        self.ensure_current(collection, &handle).await?;

        let present: Vec<RecordKey> = {
            let state = handle.state.read().await;
            let mut seen = HashSet::new();
            keys.iter()
                .filter(|k| state.records.contains_key(*k) && seen.insert(*k))
                .cloned()
                .collect()
        };
        if present.is_empty() {
            return Ok(0);
        }

        self.store.delete_records(collection, &present).await?;

        {
            let mut state = handle.state.write().await;
            for key in &present {
                state.index.remove(key);
                state.records.remove(key);
            }
        }
        handle
            .counters
            .deleted
            .fetch_add(present.len() as u64, Ordering::Relaxed);
        self.compact_if_needed(collection, &handle).await;

        debug!("Deleted {} records from {}", present.len(), collection);
        Ok(present.len())
    }

    /// Delete the chunk records of `source_id` whose chunk index is `keep` or
    /// higher, left over from a longer earlier version of the document.
    pub async fn prune_source(&self, collection: &str, source_id: &str, keep: u32) -> Result<usize> {
        let stale: Vec<RecordKey> = {
            let handle = self.collection(collection).await?;
            let state = handle.state.read().await;
            state
                .records
                .values()
                .filter(|r| {
                    r.record.source_id.as_deref() == Some(source_id)
                        && r.record.chunk_index.is_some_and(|i| i >= keep)
                })
                .map(|r| r.record.key.clone())
                .collect()
        };
        if stale.is_empty() {
            return Ok(0);
        }
        self.delete(collection, &stale).await
    }

    /// Nearest records to `vector`, at most `top_k`, all with similarity of at
    /// least `threshold`.
    ///
    /// Hits are ordered by descending similarity; equal similarities put the
    /// most recently inserted record first. The threshold may leave fewer than
    /// `top_k` hits.
    pub async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<Hit>> {
        self.query_filtered(collection, vector, top_k, threshold, &MetadataFilter::new())
            .await
    }

    /// [`VectorStore::query`] restricted to records whose metadata matches
    /// every entry of `filter`. The filter applies before the `top_k` cut.
    pub async fn query_filtered(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        threshold: f32,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let handle = self.collection(collection).await?;
        if threshold.is_nan() {
            return Err(EngineError::invalid_request("similarity threshold is NaN"));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::invalid_request(
                "query vector has non-finite components",
            ));
        }

        let started = Instant::now();
        let hits = {
            let state = handle.state.read().await;
            if vector.len() != state.spec.dimension {
                return Err(EngineError::DimensionMismatch {
                    expected: state.spec.dimension,
                    actual: vector.len(),
                });
            }
            if top_k == 0 {
                return Ok(Vec::new());
            }

            let neighbors = state.index.search(vector, top_k, |key| {
                filter.is_empty()
                    || state
                        .records
                        .get(key)
                        .is_some_and(|r| matches_filter(&r.record.metadata, filter))
            });
            neighbors
                .into_iter()
                .filter(|n| n.similarity >= threshold)
                .filter_map(|n| {
                    let stored = state.records.get(&n.key)?;
                    Some(Hit::new(n, stored))
                })
                .collect::<Vec<_>>()
        };

        handle.counters.queries.fetch_add(1, Ordering::Relaxed);
        handle
            .counters
            .query_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(hits)
    }

    /// Rebuild the collection's index from its metadata table under new
    /// parameters and swap it in atomically.
    ///
    /// Inserts and deletes wait for the rebuild; queries keep running against
    /// the old index until the swap.
    pub async fn rebuild_index(&self, collection: &str, params: IndexParams) -> Result<CollectionInfo> {
        params.validate()?;
        let handle = self.collection(collection).await?;
        let _writer = handle.writer.lock().await;
        self.ensure_current(collection, &handle).await?;

        let (metric, dimension, items) = {
            let state = handle.state.read().await;
            let items: Vec<_> = state
                .records
                .values()
                .map(|r| (r.record.key.clone(), r.record.vector.clone(), r.seq))
                .collect();
            (state.spec.metric, state.spec.dimension, items)
        };
        let count = items.len();
        let started = Instant::now();
        let index = build_index(metric, dimension, params, items).await?;

        self.store.update_index_params(collection, &params).await?;

        let info = {
            let mut state = handle.state.write().await;
            state.index = index;
            state.spec.index_params = params;
            state.info()
        };
        handle.counters.rebuilds.fetch_add(1, Ordering::Relaxed);

        info!(
            "Rebuilt index for {} ({} records, m={}, ef_construction={}) in {:?}",
            collection,
            count,
            params.m,
            params.ef_construction,
            started.elapsed()
        );
        Ok(info)
    }

    /// Rebuild the index under its current parameters once tombstones
    /// outnumber live entries. The caller holds the writer lock.
    ///
    /// The write that triggered it has already succeeded, so a failed rebuild
    /// is logged and the old index stays in place.
    async fn compact_if_needed(&self, collection: &str, handle: &Collection) {
        let (metric, dimension, params, tombstones, items) = {
            let state = handle.state.read().await;
            if !state.index.needs_compaction() {
                return;
            }
            let items: Vec<_> = state
                .records
                .values()
                .map(|r| (r.record.key.clone(), r.record.vector.clone(), r.seq))
                .collect();
            (
                state.spec.metric,
                state.spec.dimension,
                state.spec.index_params,
                state.index.tombstones(),
                items,
            )
        };

        match build_index(metric, dimension, params, items).await {
            Ok(index) => {
                handle.state.write().await.index = index;
                handle.counters.compactions.fetch_add(1, Ordering::Relaxed);
                info!("Compacted index for {} ({} tombstones dropped)", collection, tombstones);
            }
            Err(e) => warn!("Index compaction for {} failed: {}", collection, e),
        }
    }

    /// Exact-key lookup
    pub async fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<EmbeddingRecord>> {
        let handle = self.collection(collection).await?;
        let state = handle.state.read().await;
        Ok(state.records.get(key).map(|r| r.record.clone()))
    }

    pub async fn collection_info(&self, collection: &str) -> Result<CollectionInfo> {
        let handle = self.collection(collection).await?;
        let info = handle.state.read().await.info();
        Ok(info)
    }

    /// All collections, sorted by name
    pub async fn list_collections(&self) -> Vec<CollectionInfo> {
        let handles: Vec<Arc<Collection>> =
            self.collections.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(handle.state.read().await.info());
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        let handle = self.collection(collection).await?;
        let state = handle.state.read().await;
        let counters = &handle.counters;
        let queries = counters.queries.load(Ordering::Relaxed);
        let micros = counters.query_micros.load(Ordering::Relaxed);

        Ok(CollectionStats {
            name: state.spec.name.clone(),
            live_records: state.index.len(),
            tombstones: state.index.tombstones(),
            index_params: state.spec.index_params,
            queries,
            records_inserted: counters.inserted.load(Ordering::Relaxed),
            records_deleted: counters.deleted.load(Ordering::Relaxed),
            rebuilds: counters.rebuilds.load(Ordering::Relaxed),
            compactions: counters.compactions.load(Ordering::Relaxed),
            avg_query_ms: if queries == 0 {
                0.0
            } else {
                micros as f64 / queries as f64 / 1000.0
            },
        })
    }

    /// Remove a collection together with all of its records.
    pub async fn drop_collection(&self, collection: &str) -> Result<()> {
        let handle = self.collection(collection).await?;
        let _writer = handle.writer.lock().await;
        self.ensure_current(collection, &handle).await?;
        self.store.drop_collection(collection).await?;
        self.collections.write().await.remove(collection);
        info!("Dropped collection {}", collection);
        Ok(())
    }

    /// Compare live index entries, metadata rows and persisted rows.
    pub async fn consistency(&self, collection: &str) -> Result<ConsistencySnapshot> {
        let handle = self.collection(collection).await?;
        let _writer = handle.writer.lock().await;
        self.ensure_current(collection, &handle).await?;

        let mut snapshot = {
            let state = handle.state.read().await;
            let mut missing_from_index: Vec<RecordKey> = state
                .records
                .keys()
                .filter(|k| !state.index.contains(k))
                .cloned()
                .collect();
            let mut missing_from_metadata: Vec<RecordKey> = state
                .index
                .keys()
                .filter(|k| !state.records.contains_key(*k))
                .cloned()
                .collect();
            missing_from_index.sort();
            missing_from_metadata.sort();

            ConsistencySnapshot {
                collection: collection.to_string(),
                index_entries: state.index.len(),
                metadata_rows: state.records.len(),
                persisted_rows: 0,
                missing_from_index,
                missing_from_metadata,
            }
        };
        snapshot.persisted_rows = self.store.count_records(collection).await?;
        Ok(snapshot)
    }
}

async fn build_index(
    metric: DistanceMetric,
    dimension: usize,
    params: IndexParams,
    items: Vec<(RecordKey, Vec<f32>, u64)>,
) -> Result<HnswIndex> {
    tokio::task::spawn_blocking(move || HnswIndex::build(metric, dimension, params, items))
        .await
        .map_err(|e| EngineError::storage(format!("index build task failed: {e}")))
}

/// Keep only the last record for every key, in first-seen order.
fn dedupe_last_wins(records: Vec<EmbeddingRecord>) -> Vec<EmbeddingRecord> {
    let mut position: HashMap<RecordKey, usize> = HashMap::new();
    let mut out: Vec<EmbeddingRecord> = Vec::with_capacity(records.len());
    for record in records {
        match position.get(&record.key) {
            Some(&i) => out[i] = record,
            None => {
                position.insert(record.key.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}
