use crate::error::Result;
use crate::retrieval::scheduler::IngestionScheduler;
use crate::retrieval::vector_store::VectorStore;
use crate::storage::sqlite_store::SqliteRecordStore;
use quiver_embed::{CacheStats, EmbeddingCache};
use std::path::{Path, PathBuf};

use super::types::*;

/// Main status API implementation
pub struct StatusApi;

impl StatusApi {
    /// Get engine health check information
    ///
    /// `scheduler` is optional so read-only callers (search, stats) can report
    /// on the store without starting ingestion workers.
    pub async fn engine_health(
        store: &VectorStore,
        scheduler: Option<&IngestionScheduler>,
    ) -> EngineHealth {
        let mut health = EngineHealth {
            database_connected: false,
            database_error: None,
            scheduler_running: false,
            scheduler_paused: false,
            queue_depth: 0,
            queue_capacity: 0,
            collections: store.list_collections().await.len(),
            models: store.registry().models().len(),
            overall_status: HealthStatus::Critical,
        };

        match store.record_store().ping().await {
            Ok(()) => health.database_connected = true,
            Err(e) => health.database_error = Some(e.to_string()),
        }

        if let Some(scheduler) = scheduler {
            health.scheduler_running = scheduler.is_running();
            health.scheduler_paused = scheduler.is_paused();
            health.queue_depth = scheduler.pending_count();
            health.queue_capacity = scheduler.queue_capacity();
        }

        // a saturated queue rejects every new submission
        let queue_saturated = health.queue_capacity > 0 && health.queue_depth >= health.queue_capacity;

        health.overall_status = if !health.database_connected {
            HealthStatus::Critical
        } else if health.scheduler_paused || queue_saturated {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        health
    }

    /// Get description and runtime statistics for every collection
    pub async fn collection_statistics(store: &VectorStore) -> Result<Vec<CollectionStatistics>> {
        let mut statistics = Vec::new();
        for info in store.list_collections().await {
            let stats = store.collection_stats(&info.name).await?;
            statistics.push(CollectionStatistics { info, stats });
        }
        Ok(statistics)
    }

    /// Compare index entries, metadata rows and persisted rows per collection
    pub async fn validate_consistency(store: &VectorStore) -> Result<IndexConsistencyReport> {
        let mut checks = Vec::new();
        let mut summary = IssuesSummary::default();

        for info in store.list_collections().await {
            let snapshot = store.consistency(&info.name).await?;

            let mut issue_details = Vec::new();
            if snapshot.index_entries != snapshot.metadata_rows {
                issue_details.push(format!(
                    "{} live index entries but {} metadata rows",
                    snapshot.index_entries, snapshot.metadata_rows
                ));
            }
            if snapshot.metadata_rows != snapshot.persisted_rows {
                issue_details.push(format!(
                    "{} metadata rows but {} persisted rows",
                    snapshot.metadata_rows, snapshot.persisted_rows
                ));
            }
            issue_details.extend(
                snapshot
                    .missing_from_index
                    .iter()
                    .map(|key| format!("{key} has metadata but no index entry")),
            );
            issue_details.extend(
                snapshot
                    .missing_from_metadata
                    .iter()
                    .map(|key| format!("{key} is indexed without metadata")),
            );

            let status = if snapshot.is_consistent() {
                ConsistencyStatus::Healthy
            } else {
                ConsistencyStatus::Critical
            };

            if status == ConsistencyStatus::Critical {
                summary.critical_issues += issue_details.len();
                summary.recommendations.push(format!(
                    "Run `quiver rebuild {}` to rebuild the index from persisted records",
                    info.name
                ));
            }
            summary.total_issues += issue_details.len();

            checks.push(ConsistencyCheck {
                check_name: format!("Collection {}", info.name),
                status,
                description: "Index entries, metadata rows and persisted rows agree".to_string(),
                items_checked: snapshot.persisted_rows.max(snapshot.index_entries),
                issues_found: issue_details.len(),
                issue_details,
            });
        }

        if checks.is_empty() {
            summary.warning_issues += 1;
            summary.total_issues += 1;
            summary
                .recommendations
                .push("Create a collection with `quiver create-collection`".to_string());
        }

        let overall_status = if checks.iter().any(|c| c.status == ConsistencyStatus::Critical) {
            ConsistencyStatus::Critical
        } else if checks.is_empty() {
            ConsistencyStatus::Warning
        } else {
            ConsistencyStatus::Healthy
        };

        Ok(IndexConsistencyReport {
            overall_status,
            checks_performed: checks,
            issues_summary: summary,
            check_timestamp: chrono::Utc::now().timestamp(),
        })
    }

    pub async fn cache_statistics(cache: &EmbeddingCache) -> CacheStats {
        cache.stats()
    }

    /// Get current ingestion status
    pub async fn scheduler_status(scheduler: &IngestionScheduler) -> SchedulerStatus {
        SchedulerStatus {
            is_running: scheduler.is_running(),
            is_paused: scheduler.is_paused(),
            pending: scheduler.pending_count(),
            processing: scheduler.processing_count(),
            queue_capacity: scheduler.queue_capacity(),
            max_workers: scheduler.config().max_workers,
            submissions: scheduler.submissions().len(),
            metrics: scheduler.metrics(),
        }
    }

    /// Get database information and statistics
    pub async fn database_info(sqlite: &SqliteRecordStore) -> Result<DatabaseInfo> {
        let pool = sqlite.pool();

        let sqlite_version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(pool)
            .await
            .unwrap_or_else(|_| "unknown".to_string());

        let journal_mode: Option<String> = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_optional(pool)
            .await?;

        let synchronous_mode: Option<i64> = sqlx::query_scalar("PRAGMA synchronous")
            .fetch_optional(pool)
            .await?;
        let synchronous_mode = synchronous_mode.map(|v| match v {
            0 => "OFF".to_string(),
            1 => "NORMAL".to_string(),
            2 => "FULL".to_string(),
            3 => "EXTRA".to_string(),
            _ => format!("{v}"),
        });

        let page_size: Option<i64> = sqlx::query_scalar("PRAGMA page_size")
            .fetch_optional(pool)
            .await?;

        let page_count: Option<i64> = sqlx::query_scalar("PRAGMA page_count")
            .fetch_optional(pool)
            .await?;

        let mut database_files = Vec::new();
        if let Some(db_path) = sqlite.path() {
            for (path, file_type) in [
                (db_path.to_path_buf(), "main"),
                (sidecar(db_path, "-wal"), "wal"),
                (sidecar(db_path, "-shm"), "shm"),
            ] {
                if let Ok(metadata) = std::fs::metadata(&path) {
                    database_files.push(DatabaseFile {
                        path: path.to_string_lossy().to_string(),
                        size_bytes: metadata.len(),
                        file_type: file_type.to_string(),
                    });
                }
            }
        }

        let total_size_bytes = if sqlite.path().is_some() {
            Some(database_files.iter().map(|f| f.size_bytes).sum())
        } else {
            None
        };

        Ok(DatabaseInfo {
            database_type: "SQLite".to_string(),
            database_files,
            total_size_bytes,
            sqlite_info: SqliteInfo {
                version: sqlite_version,
                journal_mode,
                synchronous_mode,
                page_size: page_size.map(|p| p as u64),
                page_count: page_count.map(|p| p as u64),
            },
        })
    }
}

/// `index.db` -> `index.db-wal`
fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
