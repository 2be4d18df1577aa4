//! Ingestion scheduler: a bounded worker pool that drives queued items
//! through chunking, embedding and indexing.
//!
//! ## Pipeline
//!
//! ```text
//! submit → TaskQueue → worker ─ chunk ─ cache / provider ─ VectorStore::insert
//!                        ↑                                   │
//!                        └──── Failed → backoff → Pending ←──┘ (transient errors)
//! ```
//!
//! Each worker claims one item at a time. Embedding and storage calls run
//! under their own timeouts; a timeout is a failed attempt like any other.
//! Records that were embedded but could not be inserted are kept with the
//! item, so the retry goes straight to the insert step.
//!
//! Pausing stops workers from claiming new items. Items already being
//! processed run to completion, and nothing queued is lost.

use super::chunking_strategy::{Chunk, Chunker, TokenWindowChunker};
use super::task_queue::{
    ClaimedItem, DEFAULT_RETAINED_SUBMISSIONS, DeadLetter, FailureOutcome, IngestionItem,
    ItemEvent, ItemPayload, Progress, RetryPolicy, SubmissionId, TaskQueue,
};
use super::vector_store::VectorStore;
use crate::error::{EngineError, Result};
use crate::storage::{EmbeddingRecord, Metadata, RecordKey};
use quiver_embed::{ContentHash, EmbeddingCache, EmbeddingProvider, ModelRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Longest time an idle worker sleeps before looking at the queue again
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Scheduler configuration, read from the `[scheduler]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of concurrent workers
    pub max_workers: usize,
    /// Maximum number of items waiting for work
    pub queue_capacity: usize,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Timeout of a single embedding provider call
    pub provider_timeout_ms: u64,
    /// Timeout of a single vector store write
    pub storage_timeout_ms: u64,
    /// Inputs per provider call
    pub embed_batch_size: usize,
    /// Capacity of the state-transition event channel
    pub event_buffer: usize,
    /// Finished submissions kept for progress and dead-letter queries
    pub retained_submissions: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_capacity: 1000,
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            provider_timeout_ms: 30_000,
            storage_timeout_ms: 10_000,
            embed_batch_size: 32,
            event_buffer: 1024,
            retained_submissions: DEFAULT_RETAINED_SUBMISSIONS,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff_ms = base.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_embed_batch_size(mut self, embed_batch_size: usize) -> Self {
        self.embed_batch_size = embed_batch_size;
        self
    }

    pub fn with_retained_submissions(mut self, retained_submissions: usize) -> Self {
        self.retained_submissions = retained_submissions;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(EngineError::invalid_request("scheduler.max_workers must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::invalid_request(
                "scheduler.queue_capacity must be at least 1",
            ));
        }
        if self.embed_batch_size == 0 {
            return Err(EngineError::invalid_request(
                "scheduler.embed_batch_size must be at least 1",
            ));
        }
        if self.retained_submissions == 0 {
            return Err(EngineError::invalid_request(
                "scheduler.retained_submissions must be at least 1",
            ));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(EngineError::invalid_request(
                "scheduler.base_backoff_ms must not exceed scheduler.max_backoff_ms",
            ));
        }
        if self.provider_timeout_ms == 0 || self.storage_timeout_ms == 0 {
            return Err(EngineError::invalid_request("scheduler timeouts must be positive"));
        }
        Ok(())
    }
}

/// Cumulative scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    pub items_submitted: u64,
    pub items_completed: u64,
    pub failed_attempts: u64,
    pub items_dead_lettered: u64,
    pub retries_scheduled: u64,
    /// Inputs sent to the embedding provider
    pub chunks_embedded: u64,
    pub cache_hits: u64,
    pub provider_calls: u64,
    pub records_inserted: u64,
}

#[derive(Default)]
struct Counters {
    items_submitted: AtomicU64,
    items_completed: AtomicU64,
    failed_attempts: AtomicU64,
    items_dead_lettered: AtomicU64,
    retries_scheduled: AtomicU64,
    chunks_embedded: AtomicU64,
    cache_hits: AtomicU64,
    provider_calls: AtomicU64,
    records_inserted: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            items_dead_lettered: self.items_dead_lettered.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            chunks_embedded: self.chunks_embedded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            records_inserted: self.records_inserted.load(Ordering::Relaxed),
        }
    }
}

/// One embedding target derived from an item.
struct Unit {
    key: RecordKey,
    content: String,
    hash: ContentHash,
    metadata: Metadata,
    source: Option<(String, u32)>,
}

/// Failure of one processing step, tagged with the step for the recorded reason.
struct StepError {
    step: &'static str,
    error: EngineError,
    prepared: Option<Vec<EmbeddingRecord>>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    policy: RetryPolicy,
    queue: TaskQueue,
    store: Arc<VectorStore>,
    cache: Arc<EmbeddingCache>,
    provider: Arc<dyn EmbeddingProvider>,
    chunker: Arc<dyn Chunker>,
    paused: AtomicBool,
    shutdown: AtomicBool,
    counters: Counters,
}

/// Asynchronous ingestion front end of the engine.
pub struct IngestionScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionScheduler {
    /// Create a scheduler using the default token-window chunker.
    ///
    /// Workers are not running until [`IngestionScheduler::start`] is called;
    /// items submitted before that simply wait in the queue.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<VectorStore>,
        cache: Arc<EmbeddingCache>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        Self::new_with_chunker(
            config,
            store,
            cache,
            provider,
            Arc::new(TokenWindowChunker::default()),
        )
    }

    pub fn new_with_chunker(
        config: SchedulerConfig,
        store: Arc<VectorStore>,
        cache: Arc<EmbeddingCache>,
        provider: Arc<dyn EmbeddingProvider>,
        chunker: Arc<dyn Chunker>,
    ) -> Result<Self> {
        config.validate()?;
        let queue = TaskQueue::new(config.queue_capacity, config.event_buffer)
            .with_retention(config.retained_submissions);
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                policy: config.retry_policy(),
                config,
                queue,
                store,
                cache,
                provider,
                chunker,
                paused: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Spawn the worker pool. Calling it again while running has no effect.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return;
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        for worker_id in 0..self.inner.config.max_workers {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_id)));
        }
        info!(
            "Ingestion scheduler started with {} workers (provider: {})",
            self.inner.config.max_workers,
            self.inner.provider.provider_name()
        );
    }

    pub fn is_running(&self) -> bool {
        !self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Stop claiming items, let in-flight items finish and join the workers.
    ///
    /// Items that were not started stay queued and remain visible through
    /// [`IngestionScheduler::progress`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.queue.wake_all();
        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if handles.is_empty() {
            return;
        }
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Ingestion worker terminated abnormally: {}", e);
            }
        }
        info!(
            "Ingestion scheduler stopped ({} items still queued)",
            self.inner.queue.pending_count()
        );
    }

    /// Validate and enqueue a batch of items.
    ///
    /// Acceptance is all-or-nothing: if any item is invalid, or the batch does
    /// not fit in the queue, nothing is enqueued.
    ///
    /// # Errors
    /// - `InvalidRequest` for an empty batch
    /// - `UnknownModel`, `CollectionNotFound`, `ModelMismatch`, `ModalityMismatch`
    /// - `QueueFull` when the queue cannot take the whole batch
    /// - `ShuttingDown` after [`IngestionScheduler::shutdown`]
    pub async fn submit(&self, items: Vec<IngestionItem>) -> Result<SubmissionId> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        if items.is_empty() {
            return Err(EngineError::invalid_request("submission contains no items"));
        }

        let registry = self.inner.store.registry();
        let mut collections = HashMap::new();
        for item in &items {
            registry.resolve(&item.model)?;
            if !collections.contains_key(&item.collection) {
                let info = self.inner.store.collection_info(&item.collection).await?;
                collections.insert(item.collection.clone(), info);
            }
            let Some(info) = collections.get(&item.collection) else {
                continue;
            };
            if item.model != info.model {
                return Err(EngineError::ModelMismatch {
                    collection: info.name.clone(),
                    expected: info.model.clone(),
                    actual: item.model.clone(),
                });
            }
            if item.modality != info.modality {
                return Err(EngineError::ModalityMismatch {
                    collection: info.name.clone(),
                    expected: info.modality,
                    actual: item.modality,
                });
            }
        }

        let count = items.len();
        let submission = self.inner.queue.enqueue(items)?;
        Counters::add(&self.inner.counters.items_submitted, count);
        info!("Accepted submission {} with {} items", submission, count);
        Ok(submission)
    }

    /// Point-in-time state counts for a submission
    pub fn progress(&self, submission: SubmissionId) -> Result<Progress> {
        self.inner.queue.progress(submission)
    }

    /// Wait until every item of the submission is completed or dead-lettered,
    /// checking every `poll`.
    pub async fn wait_until_finished(
        &self,
        submission: SubmissionId,
        poll: Duration,
    ) -> Result<Progress> {
        loop {
            let progress = self.progress(submission)?;
            if progress.is_finished() {
                return Ok(progress);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stop workers from claiming new items. Idempotent.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("Ingestion paused ({} items pending)", self.inner.queue.pending_count());
        }
    }

    /// Let workers claim items again. Idempotent.
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Ingestion resumed ({} items pending)", self.inner.queue.pending_count());
        }
        self.inner.queue.wake_all();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Dead-lettered items of a submission, for inspection and resubmission
    pub fn dead_letters(&self, submission: SubmissionId) -> Result<Vec<DeadLetter>> {
        self.inner.queue.dead_letters(submission)
    }

    /// Live stream of item state transitions.
    ///
    /// A slow subscriber that falls behind by more than the event buffer
    /// receives a lag error instead of the missed events.
    pub fn subscribe(&self) -> BroadcastStream<ItemEvent> {
        BroadcastStream::new(self.inner.queue.subscribe())
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner.counters.snapshot()
    }

    /// Items waiting for work, including failed items awaiting a retry
    pub fn pending_count(&self) -> usize {
        self.inner.queue.pending_count()
    }

    pub fn processing_count(&self) -> usize {
        self.inner.queue.processing_count()
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn submissions(&self) -> Vec<SubmissionId> {
        self.inner.queue.submission_ids()
    }
}

impl Drop for IngestionScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.queue.wake_all();
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>, worker_id: usize) {
    debug!("Ingestion worker {} started", worker_id);
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if inner.paused.load(Ordering::SeqCst) {
            inner.idle(IDLE_POLL).await;
            continue;
        }

        match inner.queue.try_claim(Instant::now()) {
            Some(claimed) => inner.process(claimed).await,
            None => {
                let wait = inner
                    .queue
                    .next_retry_at()
                    .map(|due| due.saturating_duration_since(Instant::now()))
                    .unwrap_or(IDLE_POLL)
                    .min(IDLE_POLL);
                inner.idle(wait).await;
            }
        }
    }
    debug!("Ingestion worker {} stopped", worker_id);
}

impl SchedulerInner {
    async fn idle(&self, timeout: Duration) {
        tokio::select! {
            _ = self.queue.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }

    fn registry(&self) -> &ModelRegistry {
        self.store.registry()
    }

    async fn process(&self, claimed: ClaimedItem) {
        let ClaimedItem {
            id,
            item,
            attempt,
            prepared,
            ..
        } = claimed;

        match self.run(&item, prepared).await {
            Ok(inserted) => {
                self.queue.complete(id);
                Counters::add(&self.counters.items_completed, 1);
                Counters::add(&self.counters.records_inserted, inserted);
                debug!(
                    "Completed {} ({} records) on attempt {}",
                    item.description(),
                    inserted,
                    attempt
                );
            }
            Err(StepError {
                step,
                error,
                prepared,
            }) => {
                Counters::add(&self.counters.failed_attempts, 1);
                let reason = format!("{step}: {error}");
                let outcome =
                    self.queue
                        .fail(id, reason.clone(), error.is_transient(), prepared, &self.policy);
                match outcome {
                    FailureOutcome::Retry { delay } => {
                        Counters::add(&self.counters.retries_scheduled, 1);
                        warn!(
                            "Attempt {} for {} failed ({}), retrying in {:?}",
                            attempt,
                            item.description(),
                            reason,
                            delay
                        );
                    }
                    FailureOutcome::DeadLettered => {
                        Counters::add(&self.counters.items_dead_lettered, 1);
                        error!(
                            "Dead-lettered {} after {} attempts: {}",
                            item.description(),
                            attempt,
                            reason
                        );
                    }
                }
            }
        }
    }

    /// Run the steps that are still outstanding for an item.
    async fn run(
        &self,
        item: &IngestionItem,
        prepared: Option<Vec<EmbeddingRecord>>,
    ) -> std::result::Result<usize, StepError> {
        let records = match prepared {
            Some(records) => records,
            None => {
                let units = self.units(item).map_err(|error| StepError {
                    step: "chunk",
                    error,
                    prepared: None,
                })?;
                let _pin = self
                    .cache
                    .pin(&item.model, units.iter().map(|u| u.hash));
                let vectors = self.embed(item, &units).await.map_err(|error| StepError {
                    step: "embed",
                    error,
                    prepared: None,
                })?;
                build_records(item, units, vectors)
            }
        };

        self.insert(item, &records)
            .await
            .map_err(|error| StepError {
                step: "insert",
                error,
                prepared: Some(records),
            })
    }

    /// Turn an item into embedding targets.
    fn units(&self, item: &IngestionItem) -> Result<Vec<Unit>> {
        let unit = |key: RecordKey, content: String, metadata: &Metadata, source: Option<(String, u32)>| Unit {
            hash: ContentHash::compute(item.modality, &content),
            key,
            content,
            metadata: metadata.clone(),
            source,
        };

        let units = match &item.payload {
            ItemPayload::Document(doc) => {
                let chunks = if item.modality.is_textual() {
                    let max_tokens = self.registry().resolve(&item.model)?.max_tokens;
                    self.chunker.chunk(&doc.content, max_tokens)
                } else {
                    vec![Chunk::new(0, doc.content.clone())]
                };
                chunks
                    .into_iter()
                    .map(|chunk| {
                        unit(
                            RecordKey::chunk(&doc.source_id, chunk.index),
                            chunk.content,
                            &doc.metadata,
                            Some((doc.source_id.clone(), chunk.index)),
                        )
                    })
                    .collect()
            }
            ItemPayload::Chunks {
                source_id,
                chunks,
                metadata,
            } => chunks
                .iter()
                .map(|chunk| {
                    unit(
                        RecordKey::chunk(source_id, chunk.index),
                        chunk.content.clone(),
                        metadata,
                        Some((source_id.clone(), chunk.index)),
                    )
                })
                .collect(),
            ItemPayload::Content {
                key,
                content,
                metadata,
            } => {
                let hash = ContentHash::compute(item.modality, content);
                let key = key.clone().unwrap_or_else(|| RecordKey::content(&hash));
                vec![unit(key, content.clone(), metadata, None)]
            }
        };
        Ok(units)
    }

    /// Resolve one vector per unit: cache first, provider for the rest.
    async fn embed(&self, item: &IngestionItem, units: &[Unit]) -> Result<Vec<Vec<f32>>> {
        let model = &item.model;
        let dimension = self.registry().resolve(model)?.dimension;

        let mut vectors: Vec<Option<Vec<f32>>> = units
            .iter()
            .map(|u| self.cache.get(model, &u.hash))
            .collect();
        let hits = vectors.iter().filter(|v| v.is_some()).count();
        Counters::add(&self.counters.cache_hits, hits);

        // identical content inside one item is embedded once
        let mut first_by_hash: HashMap<ContentHash, usize> = HashMap::new();
        let mut duplicates: Vec<(usize, usize)> = Vec::new();
        let mut missing: Vec<usize> = Vec::new();
        for (i, unit) in units.iter().enumerate() {
            if vectors[i].is_some() {
                continue;
            }
            match first_by_hash.get(&unit.hash) {
                Some(&first) => duplicates.push((i, first)),
                None => {
                    first_by_hash.insert(unit.hash, i);
                    missing.push(i);
                }
            }
        }

        let timeout = self.config.provider_timeout();
        for batch in missing.chunks(self.config.embed_batch_size) {
            let texts = batch
                .iter()
                .map(|&i| {
                    if item.modality.is_textual() {
                        self.registry().truncate_to_limit(model, &units[i].content)
                    } else {
                        Ok(units[i].content.clone())
                    }
                })
                .collect::<quiver_embed::Result<Vec<String>>>()?;

            Counters::add(&self.counters.provider_calls, 1);
            let result = tokio::time::timeout(timeout, self.provider.embed(&texts, model))
                .await
                .map_err(|_| EngineError::ProviderTimeout {
                    model: model.clone(),
                    timeout,
                })??;

            if result.len() != batch.len() {
                return Err(EngineError::provider(format!(
                    "malformed response: {} vectors for {} inputs",
                    result.len(),
                    batch.len()
                )));
            }
            for (&i, vector) in batch.iter().zip(result.into_vectors()) {
                if vector.len() != dimension {
                    return Err(EngineError::provider(format!(
                        "malformed response: {}-dimensional vector from {} (expected {})",
                        vector.len(),
                        model,
                        dimension
                    )));
                }
                if vector.iter().any(|v| !v.is_finite()) {
                    return Err(EngineError::provider(
                        "malformed response: non-finite vector components",
                    ));
                }
                self.cache.put(model, units[i].hash, vector.clone());
                vectors[i] = Some(vector);
            }
            Counters::add(&self.counters.chunks_embedded, batch.len());
        }

        for (i, first) in duplicates {
            vectors[i] = vectors[first].clone();
        }
        vectors
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| EngineError::provider("provider left inputs without vectors"))
    }

    /// Write records under the storage timeout.
    ///
    /// The write runs as its own task, so a timed-out write still finishes and
    /// leaves the store consistent; the retry then upserts the same records.
    async fn insert(&self, item: &IngestionItem, records: &[EmbeddingRecord]) -> Result<usize> {
        let store = Arc::clone(&self.store);
        let collection = item.collection.clone();
        let batch = records.to_vec();
        let prune = match &item.payload {
            ItemPayload::Document(doc) => Some((doc.source_id.clone(), records.len() as u32)),
            _ => None,
        };

        let write = tokio::spawn(async move {
            let inserted = store.insert(&collection, batch).await?;
            if let Some((source_id, keep)) = prune {
                let pruned = store.prune_source(&collection, &source_id, keep).await?;
                if pruned > 0 {
                    debug!("Removed {} stale chunks of {}", pruned, source_id);
                }
            }
            Ok::<usize, EngineError>(inserted)
        });

        let timeout = self.config.storage_timeout();
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(EngineError::storage(format!(
                "insert task failed: {join_error}"
            ))),
            Err(_) => Err(EngineError::storage(format!(
                "insert timed out after {timeout:?}"
            ))),
        }
    }
}

fn build_records(item: &IngestionItem, units: Vec<Unit>, vectors: Vec<Vec<f32>>) -> Vec<EmbeddingRecord> {
    units
        .into_iter()
        .zip(vectors)
        .map(|(unit, vector)| {
            let record = EmbeddingRecord::new(unit.key, item.model.clone(), item.modality, vector)
                .with_metadata(unit.metadata)
                .with_content(unit.content);
            match unit.source {
                Some((source_id, index)) => record.with_source(source_id, index),
                None => record,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::task_queue::Document;
    use crate::storage::sqlite_store::SqliteRecordStore;
    use crate::storage::{
        CollectionSpec, IndexParams, RecordStore, StoredRecord,
    };
    use async_trait::async_trait;
    use futures::StreamExt;
    use quiver_embed::{DistanceMetric, HashingProvider, Modality, ModelSpec};
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::builtin_with([
                ModelSpec::new("m1", 8, DistanceMetric::Cosine).with_max_tokens(14)
            ])
            .unwrap(),
        )
    }

    /// Record store whose first `failures` upserts fail.
    struct FlakyStore {
        inner: SqliteRecordStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn create_collection(&self, spec: &CollectionSpec) -> Result<()> {
            self.inner.create_collection(spec).await
        }
        async fn load_collections(&self) -> Result<Vec<CollectionSpec>> {
            self.inner.load_collections().await
        }
        async fn update_index_params(&self, collection: &str, params: &IndexParams) -> Result<()> {
            self.inner.update_index_params(collection, params).await
        }
        async fn upsert_records(&self, collection: &str, records: &[StoredRecord]) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::storage("database is locked"));
            }
            self.inner.upsert_records(collection, records).await
        }
        async fn delete_records(&self, collection: &str, keys: &[RecordKey]) -> Result<usize> {
            self.inner.delete_records(collection, keys).await
        }
        async fn load_records(&self, collection: &str) -> Result<Vec<StoredRecord>> {
            self.inner.load_records(collection).await
        }
        async fn count_records(&self, collection: &str) -> Result<usize> {
            self.inner.count_records(collection).await
        }
        async fn drop_collection(&self, collection: &str) -> Result<()> {
            self.inner.drop_collection(collection).await
        }
        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    async fn setup_with(store: Arc<dyn RecordStore>, config: SchedulerConfig) -> (IngestionScheduler, Arc<VectorStore>) {
        let registry = registry();
        let vs = Arc::new(VectorStore::open(Arc::clone(&registry), store).await.unwrap());
        vs.create_collection("docs", Modality::Text, "m1", IndexParams::default())
            .await
            .unwrap();
        let scheduler = IngestionScheduler::new(
            config,
            Arc::clone(&vs),
            Arc::new(EmbeddingCache::new(64)),
            Arc::new(HashingProvider::new(registry)),
        )
        .unwrap();
        (scheduler, vs)
    }

    async fn setup(config: SchedulerConfig) -> (IngestionScheduler, Arc<VectorStore>) {
        let store = Arc::new(SqliteRecordStore::open_memory().await.unwrap());
        setup_with(store, config).await
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_workers(2)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(SchedulerConfig::default().with_max_workers(0).validate().is_err());
        assert!(SchedulerConfig::default().with_queue_capacity(0).validate().is_err());
        assert!(
            SchedulerConfig::default()
                .with_backoff(Duration::from_secs(2), Duration::from_secs(1))
                .validate()
                .is_err()
        );
        assert_eq!(SchedulerConfig::default().retry_policy().max_retries, 3);
    }

    #[tokio::test]
    async fn test_document_is_chunked_and_indexed() {
        let (scheduler, vs) = setup(fast_config()).await;
        scheduler.start();

        // 14 tokens -> 10 words per window; the overlap is capped at 5 words
        let text = (0..12).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let sub = scheduler
            .submit(vec![IngestionItem::document(
                "docs",
                "m1",
                Modality::Text,
                Document::new("doc-1", text),
            )])
            .await
            .unwrap();
        let progress = scheduler
            .wait_until_finished(sub, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(progress.completed, 1);

        let info = vs.collection_info("docs").await.unwrap();
        assert_eq!(info.record_count, 2);
        let first = vs
            .get("docs", &RecordKey::chunk("doc-1", 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.source_id.as_deref(), Some("doc-1"));
        assert_eq!(first.chunk_index, Some(0));

        // shorter re-ingestion supersedes the old chunks
        let sub = scheduler
            .submit(vec![IngestionItem::document(
                "docs",
                "m1",
                Modality::Text,
                Document::new("doc-1", "just a few words"),
            )])
            .await
            .unwrap();
        scheduler
            .wait_until_finished(sub, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(vs.collection_info("docs").await.unwrap().record_count, 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let (scheduler, _vs) = setup(fast_config()).await;

        let err = scheduler.submit(Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest { .. }));

        let err = scheduler
            .submit(vec![IngestionItem::content("docs", "nope", Modality::Text, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownModel { .. }));

        let err = scheduler
            .submit(vec![IngestionItem::content("missing", "m1", Modality::Text, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CollectionNotFound { .. }));

        let err = scheduler
            .submit(vec![IngestionItem::content("docs", "all-minilm", Modality::Text, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelMismatch { .. }));

        let err = scheduler
            .submit(vec![
                IngestionItem::content("docs", "m1", Modality::Text, "ok"),
                IngestionItem::content("docs", "m1", Modality::Code, "x"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModalityMismatch { .. }));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_avoids_second_provider_call() {
        let (scheduler, _vs) = setup(fast_config()).await;
        scheduler.start();

        for _ in 0..2 {
            let sub = scheduler
                .submit(vec![IngestionItem::content(
                    "docs",
                    "m1",
                    Modality::Text,
                    "the same content",
                )])
                .await
                .unwrap();
            scheduler
                .wait_until_finished(sub, Duration::from_millis(10))
                .await
                .unwrap();
        }

        let metrics = scheduler.metrics();
        assert_eq!(metrics.provider_calls, 1);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.items_completed, 2);
        scheduler.shutdown().await;
    }

    #[traced_test]
    #[tokio::test]
    async fn test_insert_retry_skips_embedding() {
        let flaky = Arc::new(FlakyStore {
            inner: SqliteRecordStore::open_memory().await.unwrap(),
            failures: AtomicUsize::new(2),
        });
        let (scheduler, vs) = setup_with(flaky, fast_config().with_max_workers(1)).await;
        scheduler.start();

        let sub = scheduler
            .submit(vec![IngestionItem::content("docs", "m1", Modality::Text, "retry me")])
            .await
            .unwrap();
        let progress = scheduler
            .wait_until_finished(sub, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(progress.completed, 1);

        let metrics = scheduler.metrics();
        assert_eq!(metrics.retries_scheduled, 2);
        assert_eq!(metrics.provider_calls, 1);
        assert_eq!(vs.collection_info("docs").await.unwrap().record_count, 1);
        assert!(logs_contain("insert: Storage error: database is locked"));
        assert!(!logs_contain("Dead-lettered"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_before_start_keeps_items_pending() {
        let (scheduler, _vs) = setup(fast_config()).await;
        scheduler.pause();
        scheduler.pause();
        assert!(scheduler.is_paused());
        scheduler.start();

        let items = (0..5)
            .map(|i| IngestionItem::content("docs", "m1", Modality::Text, format!("item {i}")))
            .collect();
        let sub = scheduler.submit(items).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.progress(sub).unwrap().pending, 5);

        scheduler.resume();
        let progress = scheduler
            .wait_until_finished(sub, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(progress.completed, 5);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_stream() {
        let (scheduler, _vs) = setup(fast_config()).await;
        let mut events = scheduler.subscribe();
        scheduler.start();

        let sub = scheduler
            .submit(vec![IngestionItem::content("docs", "m1", Modality::Text, "evented")])
            .await
            .unwrap();

        let mut states = Vec::new();
        while let Some(Ok(event)) = events.next().await {
            assert_eq!(event.submission, sub);
            states.push(event.state.name());
            if event.state.is_terminal() {
                break;
            }
        }
        assert_eq!(states, vec!["pending", "processing", "completed"]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_leaves_queued_items_inspectable() {
        let (scheduler, _vs) = setup(fast_config()).await;
        scheduler.start();
        scheduler.pause();
        let sub = scheduler
            .submit(vec![IngestionItem::content("docs", "m1", Modality::Text, "later")])
            .await
            .unwrap();
        scheduler.shutdown().await;
        assert!(!scheduler.is_running());

        assert_eq!(scheduler.progress(sub).unwrap().pending, 1);
        let err = scheduler
            .submit(vec![IngestionItem::content("docs", "m1", Modality::Text, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown));
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(
            &self,
            _texts: &[String],
            _model: &str,
        ) -> quiver_embed::Result<quiver_embed::EmbeddingResult> {
            Err(quiver_embed::EmbedError::provider("503 service unavailable"))
        }

        fn provider_name(&self) -> &str {
            "failing"
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let registry = registry();
        let vs = Arc::new(
            VectorStore::open(
                Arc::clone(&registry),
                Arc::new(SqliteRecordStore::open_memory().await.unwrap()),
            )
            .await
            .unwrap(),
        );
        vs.create_collection("docs", Modality::Text, "m1", IndexParams::default())
            .await
            .unwrap();
        let scheduler = IngestionScheduler::new(
            fast_config().with_max_retries(1),
            Arc::clone(&vs),
            Arc::new(EmbeddingCache::new(8)),
            Arc::new(FailingProvider),
        )
        .unwrap();
        scheduler.start();

        let sub = scheduler
            .submit(vec![IngestionItem::content("docs", "m1", Modality::Text, "doomed")])
            .await
            .unwrap();
        let progress = scheduler
            .wait_until_finished(sub, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(progress.dead_lettered, 1);

        let dead = scheduler.dead_letters(sub).unwrap();
        assert_eq!(dead[0].attempts, 2);
        assert!(dead[0].reason.starts_with("embed: "));
        assert!(logs_contain("retrying in"));
        assert!(logs_contain("Dead-lettered content after 2 attempts"));
        scheduler.shutdown().await;
    }
}
