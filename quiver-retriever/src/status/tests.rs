#[cfg(test)]
mod test_suite {
    use super::super::api::StatusApi;
    use super::super::types::{ConsistencyStatus, HealthStatus};
    use crate::retrieval::scheduler::{IngestionScheduler, SchedulerConfig};
    use crate::retrieval::vector_store::VectorStore;
    use crate::storage::sqlite_store::SqliteRecordStore;
    use crate::storage::{EmbeddingRecord, IndexParams};
    use anyhow::Result;
    use quiver_embed::{
        ContentHash, DistanceMetric, EmbeddingCache, HashingProvider, Modality, ModelRegistry,
        ModelSpec,
    };
    use std::sync::Arc;
    use tempfile::tempdir;

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::builtin_with([ModelSpec::new("m1", 3, DistanceMetric::Cosine)])
                .unwrap(),
        )
    }

    async fn open_store(sqlite: SqliteRecordStore) -> Result<Arc<VectorStore>> {
        Ok(Arc::new(VectorStore::open(registry(), Arc::new(sqlite)).await?))
    }

    async fn populated_store(sqlite: SqliteRecordStore) -> Result<Arc<VectorStore>> {
        let store = open_store(sqlite).await?;
        store
            .create_collection("docs", Modality::Text, "m1", IndexParams::default())
            .await?;
        store
            .insert(
                "docs",
                vec![
                    EmbeddingRecord::new("a", "m1", Modality::Text, vec![1.0, 0.0, 0.0]),
                    EmbeddingRecord::new("b", "m1", Modality::Text, vec![0.0, 1.0, 0.0]),
                ],
            )
            .await?;
        Ok(store)
    }

    fn scheduler(store: &Arc<VectorStore>) -> Result<IngestionScheduler> {
        Ok(IngestionScheduler::new(
            SchedulerConfig::default().with_max_workers(2).with_queue_capacity(5),
            Arc::clone(store),
            Arc::new(EmbeddingCache::new(16)),
            Arc::new(HashingProvider::new(registry())),
        )?)
    }

    #[tokio::test]
    async fn test_engine_health_without_scheduler() -> Result<()> {
        let store = open_store(SqliteRecordStore::open_memory().await?).await?;

        let health = StatusApi::engine_health(&store, None).await;

        assert!(health.database_connected);
        assert!(health.database_error.is_none());
        assert!(!health.scheduler_running);
        assert_eq!(health.collections, 0);
        assert_eq!(health.models, store.registry().len());
        assert_eq!(health.overall_status, HealthStatus::Healthy);

        Ok(())
    }

    #[tokio::test]
    async fn test_engine_health_paused_scheduler_is_warning() -> Result<()> {
        let store = populated_store(SqliteRecordStore::open_memory().await?).await?;
        let scheduler = scheduler(&store)?;
        scheduler.pause();

        let health = StatusApi::engine_health(&store, Some(&scheduler)).await;

        assert!(health.scheduler_paused);
        assert_eq!(health.queue_capacity, 5);
        assert_eq!(health.collections, 1);
        assert_eq!(health.overall_status, HealthStatus::Warning);

        Ok(())
    }

    #[tokio::test]
    async fn test_collection_statistics() -> Result<()> {
        let store = populated_store(SqliteRecordStore::open_memory().await?).await?;

        let statistics = StatusApi::collection_statistics(&store).await?;

        assert_eq!(statistics.len(), 1);
        assert_eq!(statistics[0].info.name, "docs");
        assert_eq!(statistics[0].info.record_count, 2);
        assert_eq!(statistics[0].stats.live_records, 2);
        assert_eq!(statistics[0].stats.records_inserted, 2);

        let json = serde_json::to_value(&statistics[0])?;
        assert_eq!(json["name"], "docs");
        assert_eq!(json["stats"]["live_records"], 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_validate_consistency_healthy_and_empty() -> Result<()> {
        let empty = open_store(SqliteRecordStore::open_memory().await?).await?;
        let report = StatusApi::validate_consistency(&empty).await?;
        assert_eq!(report.overall_status, ConsistencyStatus::Warning);
        assert!(report.checks_performed.is_empty());

        let store = populated_store(SqliteRecordStore::open_memory().await?).await?;
        let report = StatusApi::validate_consistency(&store).await?;
        assert_eq!(report.overall_status, ConsistencyStatus::Healthy);
        assert_eq!(report.checks_performed.len(), 1);
        assert_eq!(report.checks_performed[0].items_checked, 2);
        assert_eq!(report.issues_summary.total_issues, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_validate_consistency_detects_lost_rows() -> Result<()> {
        let sqlite = SqliteRecordStore::open_memory().await?;
        let pool = sqlite.pool().clone();
        let store = populated_store(sqlite).await?;

        // rows removed behind the store's back
        sqlx::query("DELETE FROM records WHERE record_key = 'a'")
            .execute(&pool)
            .await?;

        let report = StatusApi::validate_consistency(&store).await?;
        assert_eq!(report.overall_status, ConsistencyStatus::Critical);
        assert_eq!(report.checks_performed[0].status, ConsistencyStatus::Critical);
        assert!(report.issues_summary.critical_issues >= 1);
        assert!(report.issues_summary.recommendations[0].contains("rebuild docs"));

        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_status() -> Result<()> {
        let store = populated_store(SqliteRecordStore::open_memory().await?).await?;
        let scheduler = scheduler(&store)?;

        let status = StatusApi::scheduler_status(&scheduler).await;
        assert!(!status.is_running);
        assert!(!status.is_paused);
        assert_eq!(status.pending, 0);
        assert_eq!(status.max_workers, 2);
        assert_eq!(status.metrics.items_submitted, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_cache_statistics() -> Result<()> {
        let cache = EmbeddingCache::new(4);
        let hash = ContentHash::compute(Modality::Text, "hello");
        cache.put("m1", hash, vec![1.0, 0.0, 0.0]);
        assert!(cache.get("m1", &hash).is_some());

        let stats = StatusApi::cache_statistics(&cache).await;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.hits, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_database_info() -> Result<()> {
        let memory = SqliteRecordStore::open_memory().await?;
        let info = StatusApi::database_info(&memory).await?;
        assert_eq!(info.database_type, "SQLite");
        assert!(info.database_files.is_empty());
        assert!(info.total_size_bytes.is_none());
        assert_ne!(info.sqlite_info.version, "unknown");

        let temp_dir = tempdir()?;
        let on_disk = SqliteRecordStore::open(&temp_dir.path().join("quiver.db")).await?;
        let info = StatusApi::database_info(&on_disk).await?;
        assert!(info.database_files.iter().any(|f| f.file_type == "main"));
        assert_eq!(
            info.sqlite_info.journal_mode.as_deref().map(str::to_lowercase),
            Some("wal".to_string())
        );
        assert_eq!(info.sqlite_info.synchronous_mode.as_deref(), Some("NORMAL"));

        Ok(())
    }
}
