//! Query façade over the vector store.
//!
//! Embeds text queries (cache first, provider on a miss), runs the similarity
//! query with threshold, result cap and metadata filters, and optionally
//! re-ranks the candidates. Every response carries a timing breakdown.

use super::vector_store::{Hit, VectorStore};
use crate::error::{EngineError, Result};
use crate::storage::{MetadataFilter, MetadataValue};
use quiver_embed::{ContentHash, EmbeddingCache, EmbeddingProvider, Modality};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// What to search with.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    /// Free text, embedded with the collection's model
    Text(String),
    /// A ready-made query vector
    Vector(Vec<f32>),
}

/// A search request against one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub collection: String,
    pub query: QueryInput,
    /// Maximum number of hits (default 10)
    pub top_k: usize,
    /// Minimum similarity of a hit; `None` accepts any similarity
    pub threshold: Option<f32>,
    /// Exact-match metadata filters, all of which must match
    pub filters: MetadataFilter,
    /// Re-rank candidates with the engine's reranker, if it has one
    pub rerank: bool,
}

impl SearchRequest {
    pub fn text(collection: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(collection, QueryInput::Text(text.into()))
    }

    pub fn vector(collection: impl Into<String>, vector: Vec<f32>) -> Self {
        Self::new(collection, QueryInput::Vector(vector))
    }

    fn new(collection: impl Into<String>, query: QueryInput) -> Self {
        Self {
            collection: collection.into(),
            query,
            top_k: 10,
            threshold: None,
            filters: MetadataFilter::new(),
            rerank: false,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }
}

/// Where the time of a search went, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SearchTiming {
    pub embed_ms: f64,
    pub search_ms: f64,
    pub rerank_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<Hit>,
    pub timing: SearchTiming,
    /// The query embedding came from the cache
    pub query_cache_hit: bool,
    pub reranked: bool,
}

/// Second-stage ordering of search candidates.
///
/// Implementations may only reorder or drop hits, never add them.
pub trait Reranker: Send + Sync {
    fn rerank(&self, query: &str, hits: Vec<Hit>) -> Vec<Hit>;

    fn name(&self) -> &str;
}

/// Fuses the vector ranking with a keyword-overlap ranking by reciprocal
/// rank fusion: `score = 1/(k + vector_rank) + 1/(k + keyword_rank)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeywordOverlapReranker {
    k: f64,
}

impl Default for KeywordOverlapReranker {
    fn default() -> Self {
        Self { k: 60.0 }
    }
}

impl KeywordOverlapReranker {
    pub fn new(k: f64) -> Self {
        Self { k }
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

impl Reranker for KeywordOverlapReranker {
    fn rerank(&self, query: &str, hits: Vec<Hit>) -> Vec<Hit> {
        let query_terms = terms(query);
        if query_terms.is_empty() || hits.len() < 2 {
            return hits;
        }

        let overlaps: Vec<usize> = hits
            .iter()
            .map(|hit| {
                hit.content
                    .as_deref()
                    .map(|c| terms(c).intersection(&query_terms).count())
                    .unwrap_or(0)
            })
            .collect();

        // keyword rank: most overlap first, vector rank breaks ties
        let mut by_overlap: Vec<usize> = (0..hits.len()).collect();
        by_overlap.sort_by(|&a, &b| overlaps[b].cmp(&overlaps[a]).then(a.cmp(&b)));
        let mut keyword_rank = vec![0usize; hits.len()];
        for (rank, &i) in by_overlap.iter().enumerate() {
            keyword_rank[i] = rank;
        }

        let mut scored: Vec<(f64, usize, Hit)> = hits
            .into_iter()
            .enumerate()
            .map(|(vector_rank, hit)| {
                let score = 1.0 / (self.k + vector_rank as f64 + 1.0)
                    + 1.0 / (self.k + keyword_rank[vector_rank] as f64 + 1.0);
                (score, vector_rank, hit)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.into_iter().map(|(_, _, hit)| hit).collect()
    }

    fn name(&self) -> &str {
        "keyword-overlap"
    }
}

/// Read path of the engine.
pub struct QueryEngine {
    store: Arc<VectorStore>,
    cache: Arc<EmbeddingCache>,
    provider: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    provider_timeout: Duration,
    rerank_candidates_factor: usize,
}

impl QueryEngine {
    pub fn new(
        store: Arc<VectorStore>,
        cache: Arc<EmbeddingCache>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            cache,
            provider,
            reranker: None,
            provider_timeout: Duration::from_secs(30),
            rerank_candidates_factor: 3,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    /// How many candidates per requested hit are fetched when re-ranking
    pub fn with_rerank_candidates_factor(mut self, factor: usize) -> Self {
        self.rerank_candidates_factor = factor.max(1);
        self
    }

    /// Run a search.
    ///
    /// # Errors
    /// - `CollectionNotFound` for an unknown collection
    /// - `InvalidRequest` for an empty text query or a NaN threshold
    /// - `DimensionMismatch` for a query vector of the wrong length
    /// - `ProviderTimeout` / `ProviderError` when embedding the query fails
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let info = self.store.collection_info(&request.collection).await?;
        let threshold = request.threshold.unwrap_or(f32::NEG_INFINITY);

        let embed_started = Instant::now();
        let (vector, query_cache_hit, query_text) = match request.query {
            QueryInput::Text(text) => {
                if text.trim().is_empty() {
                    return Err(EngineError::invalid_request("query text is empty"));
                }
                let (vector, hit) = self.embed_query(&info.model, info.modality, &text).await?;
                (vector, hit, Some(text))
            }
            QueryInput::Vector(vector) => (vector, false, None),
        };
        let embed_ms = ms(embed_started.elapsed());

        let reranker = match (&self.reranker, &query_text) {
            (Some(reranker), Some(_)) if request.rerank => Some(reranker),
            _ => None,
        };
        let fetch_k = if reranker.is_some() {
            request.top_k.saturating_mul(self.rerank_candidates_factor)
        } else {
            request.top_k
        };

        let search_started = Instant::now();
        let mut hits = self
            .store
            .query_filtered(&request.collection, &vector, fetch_k, threshold, &request.filters)
            .await?;
        let search_ms = ms(search_started.elapsed());

        let rerank_started = Instant::now();
        let reranked = match (reranker, &query_text) {
            (Some(reranker), Some(text)) => {
                hits = reranker.rerank(text, hits);
                true
            }
            _ => false,
        };
        hits.truncate(request.top_k);
        let rerank_ms = if reranked {
            ms(rerank_started.elapsed())
        } else {
            0.0
        };

        let timing = SearchTiming {
            embed_ms,
            search_ms,
            rerank_ms,
            total_ms: ms(started.elapsed()),
        };
        debug!(
            "Search in {} returned {} hits in {:.2}ms (cache hit: {})",
            request.collection,
            hits.len(),
            timing.total_ms,
            query_cache_hit
        );

        Ok(SearchResponse {
            hits,
            timing,
            query_cache_hit,
            reranked,
        })
    }

    async fn embed_query(&self, model: &str, modality: Modality, text: &str) -> Result<(Vec<f32>, bool)> {
        // text queries against image collections are captions
        let modality = if modality.is_textual() {
            modality
        } else {
            Modality::Caption
        };
        let hash = ContentHash::compute(modality, text);
        if let Some(vector) = self.cache.get(model, &hash) {
            return Ok((vector, true));
        }

        let registry = self.store.registry();
        let input = registry.truncate_to_limit(model, text)?;
        let vector = tokio::time::timeout(self.provider_timeout, self.provider.embed_one(&input, model))
            .await
            .map_err(|_| EngineError::ProviderTimeout {
                model: model.to_string(),
                timeout: self.provider_timeout,
            })??;

        registry.validate_vector(model, &vector)?;
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::provider(
                "malformed response: non-finite vector components",
            ));
        }
        self.cache.put(model, hash, vector.clone());
        Ok((vector, false))
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
