//! SQLite implementation of [`RecordStore`]
//!
//! ## Database Schema
//!
//! ```sql
//! -- Collections: one row per named partition
//! CREATE TABLE collections (
//!     name TEXT PRIMARY KEY,
//!     modality TEXT,                  -- text | code | caption | image
//!     model TEXT,                     -- registry model id
//!     dimension INTEGER,
//!     metric TEXT,                    -- cosine | l2 | inner_product
//!     index_m INTEGER,                -- HNSW parameters
//!     index_ef_construction INTEGER,
//!     index_ef_search INTEGER,
//!     index_seed INTEGER,
//!     created_at TIMESTAMP
//! );
//!
//! -- Records: one row per (collection, key, model)
//! CREATE TABLE records (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     collection TEXT REFERENCES collections(name),
//!     record_key TEXT,
//!     model TEXT,
//!     modality TEXT,
//!     vector BLOB,                    -- little-endian f32 values
//!     dimension INTEGER,
//!     metadata TEXT,                  -- JSON object of scalars
//!     content TEXT,
//!     source_id TEXT,
//!     chunk_index INTEGER,
//!     created_at TIMESTAMP,
//!     inserted_seq INTEGER,           -- insertion order within the collection
//!     UNIQUE(collection, record_key, model)
//! );
//! ```
//!
//! The connection uses WAL journaling, a busy timeout and foreign keys, as
//! the vector store issues many small transactions from concurrent workers.

use super::{
    CollectionSpec, EmbeddingRecord, IndexParams, Metadata, RecordKey, RecordStore, StoredRecord,
};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// SQLite-backed record store.
#[derive(Clone, Debug)]
pub struct SqliteRecordStore {
    path: Option<PathBuf>,
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Open (or create) a database file.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::storage(format!("cannot create {}: {e}", parent.display())))?;
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true),
        )
        .await?;
        Self::new_with_pool(Some(path.to_path_buf()), pool).await
    }

    /// Open an in-memory database, for tests and throwaway runs.
    pub async fn open_memory() -> Result<Self> {
        // every connection to :memory: is a separate database, so pin the pool to one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(None, pool).await
    }

    async fn new_with_pool(path: Option<PathBuf>, pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        tracing::debug!(
            "Opened record store at {}",
            path.as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string())
        );
        Ok(Self { path, pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                modality TEXT NOT NULL,
                model TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                metric TEXT NOT NULL,
                index_m INTEGER NOT NULL,
                index_ef_construction INTEGER NOT NULL,
                index_ef_search INTEGER NOT NULL,
                index_seed INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                record_key TEXT NOT NULL,
                model TEXT NOT NULL,
                modality TEXT NOT NULL,
                vector BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                content TEXT,
                source_id TEXT,
                chunk_index INTEGER,
                created_at TIMESTAMP NOT NULL,
                inserted_seq INTEGER NOT NULL,
                CONSTRAINT unique_record UNIQUE(collection, record_key, model),
                FOREIGN KEY (collection) REFERENCES collections(name) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection, inserted_seq)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_source ON records(collection, source_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Database file path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_spec(row: &SqliteRow) -> Result<CollectionSpec> {
        let modality: String = row.try_get("modality")?;
        let metric: String = row.try_get("metric")?;
        Ok(CollectionSpec {
            name: row.try_get("name")?,
            modality: modality.parse().map_err(|e| EngineError::storage(format!("{e}")))?,
            model: row.try_get("model")?,
            dimension: row.try_get::<i64, _>("dimension")? as usize,
            metric: metric.parse().map_err(|e| EngineError::storage(format!("{e}")))?,
            index_params: IndexParams {
                m: row.try_get::<i64, _>("index_m")? as usize,
                ef_construction: row.try_get::<i64, _>("index_ef_construction")? as usize,
                ef_search: row.try_get::<i64, _>("index_ef_search")? as usize,
                seed: row.try_get::<i64, _>("index_seed")? as u64,
            },
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }

    fn row_to_record(row: &SqliteRow) -> Result<StoredRecord> {
        let key: String = row.try_get("record_key")?;
        let modality: String = row.try_get("modality")?;
        let dimension = row.try_get::<i64, _>("dimension")? as usize;
        let bytes: Vec<u8> = row.try_get("vector")?;
        if bytes.len() != dimension * std::mem::size_of::<f32>() {
            return Err(EngineError::storage(format!(
                "record {key} has a {}-byte vector, expected {dimension} floats",
                bytes.len()
            )));
        }
        let vector: Vec<f32> = bytemuck::allocation::pod_collect_to_vec(&bytes);
        let metadata_json: String = row.try_get("metadata")?;
        let metadata: Metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| EngineError::storage(format!("record {key} has corrupt metadata: {e}")))?;

        Ok(StoredRecord {
            record: EmbeddingRecord {
                key: RecordKey::new(key),
                model: row.try_get("model")?,
                modality: modality.parse().map_err(|e| EngineError::storage(format!("{e}")))?,
                vector,
                metadata,
                content: row.try_get("content")?,
                source_id: row.try_get("source_id")?,
                chunk_index: row
                    .try_get::<Option<i64>, _>("chunk_index")?
                    .map(|i| i as u32),
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            },
            seq: row.try_get::<i64, _>("inserted_seq")? as u64,
        })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create_collection(&self, spec: &CollectionSpec) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO collections (name, modality, model, dimension, metric,
                index_m, index_ef_construction, index_ef_search, index_seed, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&spec.name)
        .bind(spec.modality.as_str())
        .bind(&spec.model)
        .bind(spec.dimension as i64)
        .bind(spec.metric.as_str())
        .bind(spec.index_params.m as i64)
        .bind(spec.index_params.ef_construction as i64)
        .bind(spec.index_params.ef_search as i64)
        .bind(spec.index_params.seed as i64)
        .bind(spec.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(EngineError::CollectionAlreadyExists {
                    name: spec.name.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_collections(&self) -> Result<Vec<CollectionSpec>> {
        let rows = sqlx::query("SELECT * FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_spec).collect()
    }

    async fn update_index_params(&self, collection: &str, params: &IndexParams) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE collections
            SET index_m = ?1, index_ef_construction = ?2, index_ef_search = ?3, index_seed = ?4
            WHERE name = ?5
            "#,
        )
        .bind(params.m as i64)
        .bind(params.ef_construction as i64)
        .bind(params.ef_search as i64)
        .bind(params.seed as i64)
        .bind(collection)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::collection_not_found(collection));
        }
        Ok(())
    }

    async fn upsert_records(&self, collection: &str, records: &[StoredRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for stored in records {
            let record = &stored.record;
            let metadata = serde_json::to_string(&record.metadata)
                .map_err(|e| EngineError::storage(format!("cannot encode metadata: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO records (collection, record_key, model, modality, vector, dimension,
                    metadata, content, source_id, chunk_index, created_at, inserted_seq)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(collection, record_key, model) DO UPDATE SET
                    modality = excluded.modality,
                    vector = excluded.vector,
                    dimension = excluded.dimension,
                    metadata = excluded.metadata,
                    content = excluded.content,
                    source_id = excluded.source_id,
                    chunk_index = excluded.chunk_index,
                    created_at = excluded.created_at,
                    inserted_seq = excluded.inserted_seq
                "#,
            )
            .bind(collection)
            .bind(record.key.as_str())
            .bind(&record.model)
            .bind(record.modality.as_str())
            .bind(bytemuck::cast_slice::<f32, u8>(&record.vector))
            .bind(record.vector.len() as i64)
            .bind(metadata)
            .bind(record.content.as_deref())
            .bind(record.source_id.as_deref())
            .bind(record.chunk_index.map(i64::from))
            .bind(record.created_at)
            .bind(stored.seq as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_records(&self, collection: &str, keys: &[RecordKey]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for key in keys {
            let result = sqlx::query("DELETE FROM records WHERE collection = ?1 AND record_key = ?2")
                .bind(collection)
                .bind(key.as_str())
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn load_records(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query("SELECT * FROM records WHERE collection = ?1 ORDER BY inserted_seq")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn count_records(&self, collection: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?1")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM records WHERE collection = ?1")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM collections WHERE name = ?1")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::collection_not_found(collection));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
