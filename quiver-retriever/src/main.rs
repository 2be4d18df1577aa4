use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use quiver_embed::Modality;
use quiver_retriever::{
    Engine, EngineConfig,
    config::ProviderConfig,
    retrieval::{
        chunking_strategy::{detect_modality, should_index_file},
        query_engine::SearchRequest,
        task_queue::{Document, IngestionItem, ItemPayload, Progress},
        vector_store::{CollectionInfo, Hit},
    },
    status::StatusApi,
    storage::{IndexParams, Metadata, MetadataValue, RecordKey},
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

/// A CLI tool to manage quiver collections, ingest files and search them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Database file (overrides `database_path` from the config)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, default_value = "quiver.toml")]
    config: PathBuf,

    /// Use the deterministic offline embedding provider
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the database
    Init,
    /// Create a collection bound to one model and modality
    CreateCollection {
        name: String,
        /// Embedding model id
        #[arg(short, long)]
        model: String,
        /// text, code, caption or image
        #[arg(long, default_value = "text")]
        modality: Modality,
        #[command(flatten)]
        index: IndexArgs,
    },
    /// List collections
    Collections {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Ingest files and directories into a collection
    Ingest {
        collection: String,
        /// Files or directories to walk
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Search a collection by text or by raw vector
    Search {
        collection: String,
        /// Query text
        query: Option<String>,
        /// Query embedding values (comma-separated floats)
        #[arg(long, value_delimiter = ',')]
        embedding: Vec<f32>,
        /// Maximum number of results
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Minimum similarity threshold
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Metadata filter, `key=value` (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Re-rank candidates by keyword overlap
        #[arg(long)]
        rerank: bool,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Delete records by key, or the whole collection
    Delete {
        collection: String,
        /// Record keys
        keys: Vec<String>,
        /// Drop the collection with all its records
        #[arg(long)]
        drop: bool,
    },
    /// Rebuild a collection's index, optionally with new parameters
    Rebuild {
        collection: String,
        #[command(flatten)]
        index: IndexArgs,
    },
    /// Show collection statistics
    Stats {
        /// Limit to one collection
        collection: Option<String>,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show comprehensive status information
    Status {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// List registered embedding models
    Models {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(clap::Args, Debug)]
struct IndexArgs {
    /// Neighbor fan-out
    #[arg(long)]
    m: Option<usize>,
    #[arg(long)]
    ef_construction: Option<usize>,
    #[arg(long)]
    ef_search: Option<usize>,
}

impl IndexArgs {
    fn apply(&self, params: IndexParams) -> IndexParams {
        let params = self.m.map_or(params, |m| params.with_m(m));
        let params = self
            .ef_construction
            .map_or(params, |ef| params.with_ef_construction(ef));
        self.ef_search.map_or(params, |ef| params.with_ef_search(ef))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Full,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "full" => Ok(OutputFormat::Full),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct DeadLetterOutput {
    item: String,
    reason: String,
    attempts: u32,
}

#[derive(Serialize)]
struct IngestOutput {
    collection: String,
    files_found: usize,
    files_skipped: usize,
    submissions: Vec<Progress>,
    dead_letters: Vec<DeadLetterOutput>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = EngineConfig::load_or_default(Some(&args.config))?;
    if let Some(database) = &args.database {
        config.database_path = database.clone();
    }
    if args.offline {
        config.provider = ProviderConfig::Hashing;
    }

    let database_path = config.database_path.clone();
    let engine = Engine::new(config)
        .await
        .with_context(|| format!("failed to open database at {}", database_path.display()))?;

    match args.command {
        Commands::Init => {
            println!(
                "Initialized database at {}",
                engine.config().database_path.display()
            );
            Ok(())
        }
        Commands::CreateCollection {
            name,
            model,
            modality,
            index,
        } => {
            let info = engine
                .store()
                .create_collection(&name, modality, &model, index.apply(IndexParams::default()))
                .await?;
            println!(
                "Created collection {} ({} {}, dimension {}, {})",
                info.name, info.modality, info.model, info.dimension, info.metric
            );
            Ok(())
        }
        Commands::Collections { format } => {
            let collections = engine.store().list_collections().await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&collections)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Found {} collections:", collections.len());
                    for info in collections {
                        print_collection(&info, format == OutputFormat::Full);
                    }
                }
            }
            Ok(())
        }
        Commands::Ingest {
            collection,
            paths,
            format,
        } => ingest(&engine, &collection, &paths, format).await,
        Commands::Search {
            collection,
            query,
            embedding,
            limit,
            threshold,
            filters,
            rerank,
            format,
        } => {
            let mut request = match (query, embedding.is_empty()) {
                (Some(text), true) => SearchRequest::text(collection, text),
                (None, false) => SearchRequest::vector(collection, embedding),
                (Some(_), false) => bail!("Give either query text or --embedding, not both"),
                (None, true) => bail!("Give query text or --embedding"),
            };
            request = request.with_top_k(limit).with_rerank(rerank);
            if let Some(threshold) = threshold {
                request = request.with_threshold(threshold);
            }
            for filter in filters {
                let (key, value) = filter
                    .split_once('=')
                    .with_context(|| format!("Invalid filter '{filter}', expected key=value"))?;
                request = request.with_filter(key, MetadataValue::parse(value));
            }

            let response = engine.search(request).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
                OutputFormat::Summary => {
                    println!(
                        "Found {} hits in {:.1} ms:",
                        response.hits.len(),
                        response.timing.total_ms
                    );
                    for hit in &response.hits {
                        println!(
                            "  Similarity: {:.3} | Key: {} | {}",
                            hit.similarity,
                            hit.key,
                            preview(hit, 80)
                        );
                    }
                }
                OutputFormat::Full => {
                    for hit in &response.hits {
                        println!("Similarity: {:.3}", hit.similarity);
                        println!("Distance: {:.4}", hit.distance);
                        println!("Key: {}", hit.key);
                        if let Some(source) = &hit.source_id {
                            println!("Source: {} #{}", source, hit.chunk_index.unwrap_or(0));
                        }
                        for (key, value) in &hit.metadata {
                            println!("Metadata {key}: {value}");
                        }
                        println!("Content:\n{}", hit.content.as_deref().unwrap_or(""));
                        println!("---");
                    }
                    println!(
                        "Timing: embed {:.1} ms, search {:.1} ms, rerank {:.1} ms, total {:.1} ms",
                        response.timing.embed_ms,
                        response.timing.search_ms,
                        response.timing.rerank_ms,
                        response.timing.total_ms
                    );
                }
            }
            Ok(())
        }
        Commands::Delete {
            collection,
            keys,
            drop,
        } => {
            if drop {
                engine.store().drop_collection(&collection).await?;
                println!("Dropped collection {collection}");
                return Ok(());
            }
            if keys.is_empty() {
                bail!("Give record keys to delete, or --drop to remove the collection");
            }
            let keys: Vec<RecordKey> = keys.into_iter().map(RecordKey::new).collect();
            let deleted = engine.store().delete(&collection, &keys).await?;
            println!("Deleted {deleted} of {} records", keys.len());
            Ok(())
        }
        Commands::Rebuild { collection, index } => {
            let current = engine.store().collection_info(&collection).await?;
            let info = engine
                .store()
                .rebuild_index(&collection, index.apply(current.index_params))
                .await?;
            println!(
                "Rebuilt {} with {} records (m={}, ef_construction={}, ef_search={})",
                info.name,
                info.record_count,
                info.index_params.m,
                info.index_params.ef_construction,
                info.index_params.ef_search
            );
            Ok(())
        }
        Commands::Stats { collection, format } => {
            let mut statistics = StatusApi::collection_statistics(engine.store()).await?;
            if let Some(name) = &collection {
                statistics.retain(|s| &s.info.name == name);
                if statistics.is_empty() {
                    bail!("Collection not found: {name}");
                }
            }

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&statistics)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Collection Statistics:");
                    for s in &statistics {
                        println!("  {}:", s.info.name);
                        println!("    Live records: {}", s.stats.live_records);
                        println!("    Tombstones: {}", s.stats.tombstones);
                        println!(
                            "    Index: m={} ef_construction={} ef_search={}",
                            s.stats.index_params.m,
                            s.stats.index_params.ef_construction,
                            s.stats.index_params.ef_search
                        );
                        if format == OutputFormat::Full {
                            println!("    Model: {} ({})", s.info.model, s.info.metric);
                            println!("    Rebuilds: {} (compactions: {})", s.stats.rebuilds, s.stats.compactions);
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Status { format } => {
            let health = StatusApi::engine_health(engine.store(), None).await;
            let consistency = StatusApi::validate_consistency(engine.store()).await?;
            let database = StatusApi::database_info(engine.records()).await?;
            let collections = StatusApi::collection_statistics(engine.store()).await?;

            match format {
                OutputFormat::Json => {
                    #[derive(Serialize)]
                    struct StatusOutput {
                        health: quiver_retriever::status::EngineHealth,
                        consistency: quiver_retriever::status::IndexConsistencyReport,
                        database: quiver_retriever::status::DatabaseInfo,
                        collections: Vec<quiver_retriever::status::CollectionStatistics>,
                    }

                    let output = StatusOutput {
                        health,
                        consistency,
                        database,
                        collections,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Quiver Status");
                    println!("=============");

                    println!("\nHealth:");
                    println!("  Overall status: {:?}", health.overall_status);
                    println!(
                        "  Database connected: {}",
                        if health.database_connected { "Yes" } else { "No" }
                    );
                    if let Some(ref error) = health.database_error {
                        println!("  Database error: {error}");
                    }
                    println!("  Collections: {}", health.collections);
                    println!("  Models: {}", health.models);

                    println!("\nConsistency: {:?}", consistency.overall_status);
                    for check in &consistency.checks_performed {
                        println!(
                            "  {}: {:?} ({} items, {} issues)",
                            check.check_name, check.status, check.items_checked, check.issues_found
                        );
                        if format == OutputFormat::Full {
                            for detail in &check.issue_details {
                                println!("    - {detail}");
                            }
                        }
                    }
                    for recommendation in &consistency.issues_summary.recommendations {
                        println!("  Recommendation: {recommendation}");
                    }

                    println!("\nDatabase:");
                    println!("  SQLite version: {}", database.sqlite_info.version);
                    if let Some(size) = database.total_size_bytes {
                        println!("  Total size: {size} bytes");
                    }
                    if format == OutputFormat::Full {
                        for file in &database.database_files {
                            println!("  {} ({}): {} bytes", file.path, file.file_type, file.size_bytes);
                        }
                    }

                    println!("\nCollections:");
                    for s in &collections {
                        println!(
                            "  {} | {} {} | {} records",
                            s.info.name, s.info.modality, s.info.model, s.stats.live_records
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Models { format } => {
            let mut specs: Vec<_> = engine.registry().specs().cloned().collect();
            specs.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&specs)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Registered models:");
                    for spec in specs {
                        let modalities: Vec<&str> =
                            spec.modalities.iter().map(|m| m.as_str()).collect();
                        println!(
                            "  {} | dim {} | {} | max {} tokens | {}",
                            spec.id,
                            spec.dimension,
                            spec.metric,
                            spec.max_tokens,
                            modalities.join(",")
                        );
                        if format == OutputFormat::Full && !spec.description.is_empty() {
                            println!("    {}", spec.description);
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

async fn ingest(
    engine: &Engine,
    collection: &str,
    paths: &[PathBuf],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let info = engine.store().collection_info(collection).await?;

    let mut items = Vec::new();
    let mut files_skipped = 0;
    for path in paths {
        for entry in ignore::Walk::new(path) {
            let entry = entry?;
            let file = entry.path();
            if !file.is_file() || !should_index_file(file) {
                continue;
            }
            match file_item(&info, file) {
                Some(item) => items.push(item),
                None => files_skipped += 1,
            }
        }
    }
    let files_found = items.len();

    let scheduler = engine.scheduler();
    scheduler.start();

    if format == OutputFormat::Full {
        let mut events = scheduler.subscribe();
        tokio::spawn(async move {
            while let Some(Ok(event)) = events.next().await {
                eprintln!("  {} {}: {}", event.submission, event.item, event.state.name());
            }
        });
    }

    // the queue accepts a submission only if all of it fits
    let mut submissions = Vec::new();
    let mut dead_letters = Vec::new();
    for batch in items.chunks(scheduler.queue_capacity()) {
        let submission = engine.submit(batch.to_vec()).await?;
        let progress = scheduler
            .wait_until_finished(submission, Duration::from_millis(100))
            .await?;
        for dead in scheduler.dead_letters(submission)? {
            dead_letters.push(DeadLetterOutput {
                item: dead.item.description(),
                reason: dead.reason,
                attempts: dead.attempts,
            });
        }
        submissions.push(progress);
    }
    engine.shutdown().await;

    let completed: usize = submissions.iter().map(|p| p.completed).sum();
    match format {
        OutputFormat::Json => {
            let output = IngestOutput {
                collection: collection.to_string(),
                files_found,
                files_skipped,
                submissions,
                dead_letters,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Summary | OutputFormat::Full => {
            println!(
                "Ingested {completed} of {files_found} files into {collection} ({files_skipped} skipped)"
            );
            for dead in &dead_letters {
                println!(
                    "  Dead-lettered: {} after {} attempts: {}",
                    dead.item, dead.attempts, dead.reason
                );
            }
        }
    }
    Ok(())
}

/// Ingestion item for one file, or `None` if the file does not fit the
/// collection's modality.
fn file_item(info: &CollectionInfo, path: &Path) -> Option<IngestionItem> {
    let detected = detect_modality(path);
    let source_id = path.display().to_string();

    let mut metadata = Metadata::new();
    metadata.insert("path".to_string(), source_id.clone().into());
    metadata.insert("file_modality".to_string(), detected.as_str().into());
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        metadata.insert("extension".to_string(), ext.into());
    }

    match (info.modality, detected) {
        // images are referenced by path
        (Modality::Image, Modality::Image) => Some(IngestionItem {
            payload: ItemPayload::Content {
                key: Some(RecordKey::new(source_id.clone())),
                content: source_id,
                metadata,
            },
            collection: info.name.clone(),
            model: info.model.clone(),
            modality: Modality::Image,
        }),
        (Modality::Image, _) | (_, Modality::Image) => None,
        (target, _) => {
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    return None;
                }
            };
            if content.trim().is_empty() {
                return None;
            }
            Some(IngestionItem::document(
                info.name.clone(),
                info.model.clone(),
                target,
                Document::new(source_id, content).with_metadata(metadata),
            ))
        }
    }
}

fn print_collection(info: &CollectionInfo, full: bool) {
    println!(
        "  {} | {} | {} (dim {}, {}) | {} records",
        info.name, info.modality, info.model, info.dimension, info.metric, info.record_count
    );
    if full {
        println!(
            "    Index: m={} ef_construction={} ef_search={} | created {}",
            info.index_params.m,
            info.index_params.ef_construction,
            info.index_params.ef_search,
            info.created_at.to_rfc3339()
        );
    }
}

fn preview(hit: &Hit, width: usize) -> String {
    hit.content
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(width)
        .collect()
}
