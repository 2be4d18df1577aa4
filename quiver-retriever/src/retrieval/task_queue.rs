//! Ingestion work items, their state machine, and the bounded queue that
//! holds them.
//!
//! ```text
//! Pending → Processing → Completed
//!                      → Failed(reason) → Pending        (after backoff)
//!                                       → DeadLettered   (retry budget exhausted)
//! ```
//!
//! The queue owns every item until it finishes. Workers claim items one at a
//! time; a claim moves the item to `Processing` under the queue lock, so no two
//! workers ever hold the same item. Failed items wait in a delay set until
//! their backoff elapses and are then made `Pending` again by the next claim.
//!
//! A completed item gives up its payload and keeps only its state. Once every
//! item of a submission is terminal the submission joins a retention window;
//! the oldest finished submissions beyond that window are forgotten, dead
//! letters included.

use crate::error::{EngineError, Result};
use crate::retrieval::chunking_strategy::Chunk;
use crate::storage::{EmbeddingRecord, Metadata, RecordKey};
use chrono::{DateTime, Utc};
use quiver_embed::Modality;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast};
use tracing::debug;

/// Identifier returned by a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(u64);

impl SubmissionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl FromStr for SubmissionId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_prefix("sub-")
            .unwrap_or(s)
            .parse::<u64>()
            .map(Self)
            .map_err(|_| EngineError::invalid_request(format!("invalid submission id: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

/// Caller-owned source document. The engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique source identifier
    pub source_id: String,
    /// Raw content, or a content reference for non-text modalities
    pub content: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            content: content.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What an ingestion item carries.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemPayload {
    /// A whole document, chunked by the scheduler
    Document(Document),
    /// Chunks produced outside the engine
    Chunks {
        source_id: String,
        chunks: Vec<Chunk>,
        metadata: Metadata,
    },
    /// Standalone content, keyed by `key` or by its content hash
    Content {
        key: Option<RecordKey>,
        content: String,
        metadata: Metadata,
    },
}

/// Queue unit: one payload bound for one collection under one model.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionItem {
    pub payload: ItemPayload,
    pub collection: String,
    pub model: String,
    pub modality: Modality,
}

impl IngestionItem {
    pub fn document(
        collection: impl Into<String>,
        model: impl Into<String>,
        modality: Modality,
        document: Document,
    ) -> Self {
        Self {
            payload: ItemPayload::Document(document),
            collection: collection.into(),
            model: model.into(),
            modality,
        }
    }

    pub fn chunks(
        collection: impl Into<String>,
        model: impl Into<String>,
        modality: Modality,
        source_id: impl Into<String>,
        chunks: Vec<Chunk>,
    ) -> Self {
        Self {
            payload: ItemPayload::Chunks {
                source_id: source_id.into(),
                chunks,
                metadata: Metadata::new(),
            },
            collection: collection.into(),
            model: model.into(),
            modality,
        }
    }

    pub fn content(
        collection: impl Into<String>,
        model: impl Into<String>,
        modality: Modality,
        content: impl Into<String>,
    ) -> Self {
        Self {
            payload: ItemPayload::Content {
                key: None,
                content: content.into(),
                metadata: Metadata::new(),
            },
            collection: collection.into(),
            model: model.into(),
            modality,
        }
    }

    /// Short description for logging
    pub fn description(&self) -> String {
        match &self.payload {
            ItemPayload::Document(doc) => format!("document {}", doc.source_id),
            ItemPayload::Chunks {
                source_id, chunks, ..
            } => format!("{} chunks of {}", chunks.len(), source_id),
            ItemPayload::Content { key: Some(key), .. } => format!("content {key}"),
            ItemPayload::Content { key: None, .. } => "content".to_string(),
        }
    }
}

/// Processing state of an ingestion item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Processing,
    Completed,
    Failed { reason: String },
    DeadLettered { reason: String },
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// A state transition, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemEvent {
    pub submission: SubmissionId,
    pub item: ItemId,
    pub state: ItemState,
    /// Attempts started so far
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Exponential backoff with jitter and a bounded retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based): `min(max, base * 2^(attempt-1))` scaled by `jitter`,
    /// which is clamped to `[0.5, 1.0]`.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        raw.mul_f64(jitter.clamp(0.5, 1.0))
    }

    /// [`RetryPolicy::delay_for`] with a random jitter factor
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        self.delay_for(attempt, jitter)
    }
}

/// Point-in-time counts for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub submission: SubmissionId,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    /// Failed and waiting for a retry
    pub failed: usize,
    pub dead_lettered: usize,
}

impl Progress {
    /// Every item reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.completed + self.dead_lettered == self.total
    }
}

/// A dead-lettered item with the reason it was given up on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub item_id: ItemId,
    pub reason: String,
    pub attempts: u32,
    pub item: IngestionItem,
}

/// An item handed to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub id: ItemId,
    pub submission: SubmissionId,
    pub item: Arc<IngestionItem>,
    /// 1-based number of this attempt
    pub attempt: u32,
    /// Records prepared by an earlier attempt that failed while inserting
    pub prepared: Option<Vec<EmbeddingRecord>>,
}

/// What happened to a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Scheduled for another attempt after `delay`
    Retry { delay: Duration },
    DeadLettered,
}

#[derive(Debug)]
struct Entry {
    submission: SubmissionId,
    /// Released once the item completes
    item: Option<Arc<IngestionItem>>,
    label: String,
    state: ItemState,
    attempts: u32,
    prepared: Option<Vec<EmbeddingRecord>>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_item: u64,
    next_submission: u64,
    entries: HashMap<ItemId, Entry>,
    ready: VecDeque<ItemId>,
    delayed: BTreeSet<(Instant, ItemId)>,
    submissions: HashMap<SubmissionId, Submission>,
    /// Finished submissions, oldest first
    finished: VecDeque<SubmissionId>,
    /// Pending items plus failed items awaiting a retry
    outstanding: usize,
}

#[derive(Debug)]
struct Submission {
    items: Vec<ItemId>,
    /// Items not yet completed or dead-lettered
    unfinished: usize,
}

impl QueueState {
    /// Count one more terminal item for `submission`, then forget the oldest
    /// finished submissions beyond `retention`.
    fn finish_item(&mut self, submission: SubmissionId, retention: usize) {
        let Some(slot) = self.submissions.get_mut(&submission) else {
            return;
        };
        slot.unfinished = slot.unfinished.saturating_sub(1);
        if slot.unfinished > 0 {
            return;
        }
        self.finished.push_back(submission);
        while self.finished.len() > retention {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if let Some(slot) = self.submissions.remove(&oldest) {
                for id in slot.items {
                    self.entries.remove(&id);
                }
                debug!("Forgot finished {}", oldest);
            }
        }
    }
}

/// Finished submissions kept for `progress` and `dead_letters` by default
pub const DEFAULT_RETAINED_SUBMISSIONS: usize = 256;

/// Bounded queue of ingestion items.
pub struct TaskQueue {
    capacity: usize,
    retention: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<ItemEvent>,
}

impl TaskQueue {
    pub fn new(capacity: usize, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            capacity,
            retention: DEFAULT_RETAINED_SUBMISSIONS,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            events,
        }
    }

    /// Keep at most `retention` finished submissions
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, submission: SubmissionId, item: ItemId, entry: &Entry) {
        debug!(
            "{} ({}) of {} -> {}",
            item,
            entry.label,
            submission,
            entry.state.name()
        );
        // no subscribers is fine
        let _ = self.events.send(ItemEvent {
            submission,
            item,
            state: entry.state.clone(),
            attempts: entry.attempts,
            at: Utc::now(),
        });
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Accept all items or none of them.
    ///
    /// # Errors
    /// `QueueFull` when the items do not fit next to the outstanding work.
    pub fn enqueue(&self, items: Vec<IngestionItem>) -> Result<SubmissionId> {
        let mut state = self.lock();
        let available = self.capacity.saturating_sub(state.outstanding);
        if items.len() > available {
            return Err(EngineError::QueueFull {
                requested: items.len(),
                available,
                capacity: self.capacity,
            });
        }

        let submission = SubmissionId(state.next_submission);
        state.next_submission += 1;

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = ItemId(state.next_item);
            state.next_item += 1;
            let entry = Entry {
                submission,
                label: item.description(),
                item: Some(Arc::new(item)),
                state: ItemState::Pending,
                attempts: 0,
                prepared: None,
            };
            self.publish(submission, id, &entry);
            state.entries.insert(id, entry);
            state.ready.push_back(id);
            ids.push(id);
        }
        state.outstanding += ids.len();
        let unfinished = ids.len();
        state.submissions.insert(
            submission,
            Submission {
                items: ids,
                unfinished,
            },
        );
        drop(state);

        self.notify.notify_waiters();
        Ok(submission)
    }

    /// Claim the next pending item, first making due retries pending again.
    pub fn try_claim(&self, now: Instant) -> Option<ClaimedItem> {
        let mut state = self.lock();
        let state = &mut *state;

        while let Some(&(due, id)) = state.delayed.first() {
            if due > now {
                break;
            }
            state.delayed.pop_first();
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.state = ItemState::Pending;
                self.publish(entry.submission, id, entry);
                state.ready.push_back(id);
            }
        }

        let id = state.ready.pop_front()?;
        let entry = state.entries.get_mut(&id)?;
        let item = Arc::clone(entry.item.as_ref()?);
        entry.state = ItemState::Processing;
        entry.attempts += 1;
        state.outstanding = state.outstanding.saturating_sub(1);
        self.publish(entry.submission, id, entry);

        Some(ClaimedItem {
            id,
            submission: entry.submission,
            item,
            attempt: entry.attempts,
            prepared: entry.prepared.take(),
        })
    }

    /// When the earliest waiting retry becomes due
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.lock().delayed.first().map(|(due, _)| *due)
    }

    pub fn complete(&self, id: ItemId) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        entry.state = ItemState::Completed;
        entry.item = None;
        entry.prepared = None;
        self.publish(entry.submission, id, entry);
        let submission = entry.submission;
        state.finish_item(submission, self.retention);
    }

    /// Record a failed attempt and decide between retry and dead letter.
    ///
    /// `prepared` holds records that were ready for insertion, so the retry can
    /// skip the embedding step.
    pub fn fail(
        &self,
        id: ItemId,
        reason: String,
        transient: bool,
        prepared: Option<Vec<EmbeddingRecord>>,
        policy: &RetryPolicy,
    ) -> FailureOutcome {
        let mut state = self.lock();
        let state = &mut *state;
        let Some(entry) = state.entries.get_mut(&id) else {
            return FailureOutcome::DeadLettered;
        };

        entry.state = ItemState::Failed {
            reason: reason.clone(),
        };
        entry.prepared = prepared;
        self.publish(entry.submission, id, entry);

        if !transient || entry.attempts > policy.max_retries {
            entry.state = ItemState::DeadLettered { reason };
            entry.prepared = None;
            self.publish(entry.submission, id, entry);
            let submission = entry.submission;
            state.finish_item(submission, self.retention);
            return FailureOutcome::DeadLettered;
        }

        let delay = policy.backoff(entry.attempts);
        state.delayed.insert((Instant::now() + delay, id));
        state.outstanding += 1;
        FailureOutcome::Retry { delay }
    }

    pub fn progress(&self, submission: SubmissionId) -> Result<Progress> {
        let state = self.lock();
        let ids = &state
            .submissions
            .get(&submission)
            .ok_or(EngineError::SubmissionNotFound {
                id: submission.as_u64(),
            })?
            .items;

        let mut progress = Progress {
            submission,
            total: ids.len(),
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            dead_lettered: 0,
        };
        for entry in ids.iter().filter_map(|id| state.entries.get(id)) {
            match entry.state {
                ItemState::Pending => progress.pending += 1,
                ItemState::Processing => progress.processing += 1,
                ItemState::Completed => progress.completed += 1,
                ItemState::Failed { .. } => progress.failed += 1,
                ItemState::DeadLettered { .. } => progress.dead_lettered += 1,
            }
        }
        Ok(progress)
    }

    pub fn dead_letters(&self, submission: SubmissionId) -> Result<Vec<DeadLetter>> {
        let state = self.lock();
        let ids = &state
            .submissions
            .get(&submission)
            .ok_or(EngineError::SubmissionNotFound {
                id: submission.as_u64(),
            })?
            .items;

        Ok(ids
            .iter()
            .filter_map(|id| {
                let entry = state.entries.get(id)?;
                match (&entry.state, &entry.item) {
                    (ItemState::DeadLettered { reason }, Some(item)) => Some(DeadLetter {
                        item_id: *id,
                        reason: reason.clone(),
                        attempts: entry.attempts,
                        item: (**item).clone(),
                    }),
                    _ => None,
                }
            })
            .collect())
    }

    /// Items that still need work: pending plus failed awaiting retry
    pub fn pending_count(&self) -> usize {
        self.lock().outstanding
    }

    pub fn processing_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.state == ItemState::Processing)
            .count()
    }

    pub fn submission_ids(&self) -> Vec<SubmissionId> {
        let mut ids: Vec<SubmissionId> = self.lock().submissions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.events.subscribe()
    }

    /// Resolves when new items are enqueued (or on any other wake-up)
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Wake every waiting worker
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}
