pub mod chunking_strategy;
pub mod hnsw;
pub mod query_engine;
pub mod scheduler;
pub mod task_queue;
pub mod vector_store;
