//! Top-level engine that wires the components together.
//!
//! One [`Engine`] owns the model registry, the record store, the vector store,
//! the embedding cache and provider, the ingestion scheduler and the query
//! engine. Every component is also reachable on its own, so callers that
//! only need one part (the CLI's `search`, for example) never start workers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use quiver_retriever::config::EngineConfig;
//! use quiver_retriever::engine::Engine;
//! use quiver_retriever::retrieval::query_engine::SearchRequest;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = Engine::new(EngineConfig::default()).await?;
//! engine.scheduler().start();
//! let response = engine.search(SearchRequest::text("docs", "vector search")).await?;
//! println!("{} hits", response.hits.len());
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::EngineConfig;
use crate::error::Result;
use crate::retrieval::query_engine::{
    KeywordOverlapReranker, QueryEngine, SearchRequest, SearchResponse,
};
use crate::retrieval::scheduler::IngestionScheduler;
use crate::retrieval::task_queue::{IngestionItem, SubmissionId};
use crate::retrieval::vector_store::VectorStore;
use crate::status::{EngineHealth, StatusApi};
use crate::storage::sqlite_store::SqliteRecordStore;
use quiver_embed::{EmbeddingCache, EmbeddingProvider, ModelRegistry};
use std::sync::Arc;
use tracing::info;

pub struct Engine {
    config: EngineConfig,
    registry: Arc<ModelRegistry>,
    records: SqliteRecordStore,
    store: Arc<VectorStore>,
    cache: Arc<EmbeddingCache>,
    provider: Arc<dyn EmbeddingProvider>,
    scheduler: IngestionScheduler,
    query: QueryEngine,
}

impl Engine {
    /// Open the engine over the configured database file.
    ///
    /// Persisted collections are loaded and their indexes rebuilt. Ingestion
    /// workers are not started; call `scheduler().start()` for that.
    ///
    /// # Errors
    /// - `InvalidRequest` for an invalid configuration
    /// - `StorageError` if the database cannot be opened
    pub async fn new(config: EngineConfig) -> Result<Self> {
        Self::new_impl(config, false, None).await
    }

    /// Open the engine over an in-memory database, lost when dropped.
    pub async fn new_memory(config: EngineConfig) -> Result<Self> {
        Self::new_impl(config, true, None).await
    }

    /// In-memory engine using `provider` instead of the configured one.
    pub async fn new_memory_with_provider(
        config: EngineConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        Self::new_impl(config, true, Some(provider)).await
    }

    async fn new_impl(
        config: EngineConfig,
        use_memory: bool,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(config.registry()?);

        let records = if use_memory {
            SqliteRecordStore::open_memory().await?
        } else {
            SqliteRecordStore::open(&config.database_path).await?
        };
        let store = Arc::new(VectorStore::open(Arc::clone(&registry), Arc::new(records.clone())).await?);

        let provider = match provider {
            Some(provider) => provider,
            None => config.build_provider(Arc::clone(&registry))?,
        };
        let cache = Arc::new(EmbeddingCache::new(config.cache.capacity));

        let scheduler = IngestionScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&provider),
        )?;
        let query = QueryEngine::new(Arc::clone(&store), Arc::clone(&cache), Arc::clone(&provider))
            .with_reranker(Arc::new(KeywordOverlapReranker::default()))
            .with_provider_timeout(config.scheduler.provider_timeout());

        info!(
            "Engine ready: {} models, {} collections, provider {}",
            registry.len(),
            store.list_collections().await.len(),
            provider.provider_name()
        );

        Ok(Self {
            config,
            registry,
            records,
            store,
            cache,
            provider,
            scheduler,
            query,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The SQLite store underneath the vector store
    pub fn records(&self) -> &SqliteRecordStore {
        &self.records
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn scheduler(&self) -> &IngestionScheduler {
        &self.scheduler
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query
    }

    pub async fn submit(&self, items: Vec<IngestionItem>) -> Result<SubmissionId> {
        self.scheduler.submit(items).await
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        self.query.search(request).await
    }

    pub async fn health(&self) -> EngineHealth {
        StatusApi::engine_health(&self.store, Some(&self.scheduler)).await
    }

    /// Stop the workers, letting in-flight items finish.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        info!("Engine shut down");
    }
}
