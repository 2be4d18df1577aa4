use crate::retrieval::scheduler::SchedulerMetrics;
use crate::retrieval::vector_store::{CollectionInfo, CollectionStats};
use serde::{Deserialize, Serialize};

/// Engine health check information
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    /// Record store connectivity status
    pub database_connected: bool,
    /// Record store error message (if any)
    pub database_error: Option<String>,
    /// Are ingestion workers running?
    pub scheduler_running: bool,
    pub scheduler_paused: bool,
    /// Items waiting for work
    pub queue_depth: usize,
    pub queue_capacity: usize,
    /// Number of collections
    pub collections: usize,
    /// Registered embedding models
    pub models: usize,
    /// Overall health status
    pub overall_status: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Description and runtime statistics of one collection
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatistics {
    #[serde(flatten)]
    pub info: CollectionInfo,
    pub stats: CollectionStats,
}

/// Current ingestion status
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub is_paused: bool,
    /// Pending items plus failed items awaiting a retry
    pub pending: usize,
    pub processing: usize,
    pub queue_capacity: usize,
    pub max_workers: usize,
    pub submissions: usize,
    pub metrics: SchedulerMetrics,
}

/// Index consistency check results
#[derive(Debug, Clone, Serialize)]
pub struct IndexConsistencyReport {
    /// Overall consistency status
    pub overall_status: ConsistencyStatus,
    /// Checks performed, one per collection
    pub checks_performed: Vec<ConsistencyCheck>,
    /// Summary of issues found
    pub issues_summary: IssuesSummary,
    /// Unix timestamp when the check was performed
    pub check_timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyCheck {
    /// Name of the check
    pub check_name: String,
    /// Check status
    pub status: ConsistencyStatus,
    /// Description of what was checked
    pub description: String,
    /// Number of items checked
    pub items_checked: usize,
    /// Number of issues found
    pub issues_found: usize,
    /// Details about issues (if any)
    pub issue_details: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IssuesSummary {
    /// Total issues found
    pub total_issues: usize,
    /// Critical issues requiring immediate attention
    pub critical_issues: usize,
    /// Warning issues that should be addressed
    pub warning_issues: usize,
    /// Recommendations for fixing issues
    pub recommendations: Vec<String>,
}

/// Database information and statistics
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub database_type: String,
    /// Database file locations and sizes
    pub database_files: Vec<DatabaseFile>,
    /// Total database size in bytes
    pub total_size_bytes: Option<u64>,
    pub sqlite_info: SqliteInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseFile {
    pub path: String,
    pub size_bytes: u64,
    /// File type (main database, WAL, shared memory)
    pub file_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SqliteInfo {
    pub version: String,
    /// Journal mode (WAL, DELETE, MEMORY, ...)
    pub journal_mode: Option<String>,
    pub synchronous_mode: Option<String>,
    pub page_size: Option<u64>,
    pub page_count: Option<u64>,
}
