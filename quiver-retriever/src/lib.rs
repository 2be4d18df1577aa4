//! quiver-retriever: multi-modal vector ingestion and retrieval
//!
//! This crate turns documents, pre-chunked text and standalone content into
//! embeddings, stores them in named collections with an approximate
//! nearest-neighbor index, and answers similarity queries against them.
//! Ingestion runs on a bounded, pausable queue with retry, backoff and a
//! dead-letter state; queries go through a cache-aware embedding path and an
//! optional re-ranking stage.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: HNSW index, vector store, chunking, task queue,
//!   ingestion scheduler and query engine
//! - **[`storage`]**: record persistence with a SQLite implementation
//! - **[`status`]**: health, consistency and statistics reports
//! - **[`config`]**: TOML engine configuration
//! - **[`engine`]**: the [`Engine`] that owns and wires every component
//! - **[`error`]**: the [`EngineError`] taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quiver_retriever::{Document, Engine, EngineConfig, IngestionItem, SearchRequest};
//! use quiver_retriever::storage::IndexParams;
//! use quiver_embed::Modality;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = Engine::new(EngineConfig::default()).await?;
//! engine
//!     .store()
//!     .create_collection("docs", Modality::Text, "nomic-embed-text", IndexParams::default())
//!     .await?;
//! engine.scheduler().start();
//!
//! let doc = Document::new("readme", "quiver stores embeddings in collections");
//! let submission = engine
//!     .submit(vec![IngestionItem::document("docs", "nomic-embed-text", Modality::Text, doc)])
//!     .await?;
//! engine
//!     .scheduler()
//!     .wait_until_finished(submission, Duration::from_millis(100))
//!     .await?;
//!
//! let response = engine.search(SearchRequest::text("docs", "where are embeddings kept?")).await?;
//! for hit in response.hits {
//!     println!("{:.3} {}", hit.similarity, hit.key);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! submit → TaskQueue → workers → Chunker → EmbeddingCache / Provider → VectorStore
//!                                                                        │
//! search → QueryEngine → EmbeddingCache / Provider → HnswIndex ──────────┤
//!                                                                        │
//!                                                       RecordStore (SQLite)
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod retrieval;
pub mod status;
pub mod storage;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use retrieval::query_engine::{QueryEngine, SearchRequest, SearchResponse};
pub use retrieval::scheduler::{IngestionScheduler, SchedulerConfig};
pub use retrieval::task_queue::{Document, IngestionItem, ItemState, Progress, SubmissionId};
pub use retrieval::vector_store::{Hit, VectorStore};
