//! Splitting documents into embeddable chunks, and deciding which files are
//! worth ingesting at all.

use quiver_embed::{Modality, ModelRegistry};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An ordered slice of a document's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position within the document, starting at 0
    pub index: u32,
    pub content: String,
    /// Estimated token count of `content`
    pub token_count: usize,
}

impl Chunk {
    pub fn new(index: u32, content: impl Into<String>) -> Self {
        let content = content.into();
        let token_count = ModelRegistry::estimate_tokens(&content);
        Self {
            index,
            content,
            token_count,
        }
    }
}

/// Document pre-processing step run by the ingestion scheduler.
pub trait Chunker: Send + Sync {
    /// Split `content` into chunks of at most `max_tokens` estimated tokens.
    fn chunk(&self, content: &str, max_tokens: usize) -> Vec<Chunk>;
}

/// Word-window chunker sized from a model's token limit.
///
/// Tokens are estimated at 1.3 per whitespace-separated word, so a window
/// holds `floor(max_tokens / 1.3)` words. Consecutive windows share
/// `overlap` words, at most half a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenWindowChunker {
    overlap: usize,
}

impl Default for TokenWindowChunker {
    fn default() -> Self {
        Self { overlap: 16 }
    }
}

impl TokenWindowChunker {
    pub fn new(overlap: usize) -> Self {
        Self { overlap }
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

impl Chunker for TokenWindowChunker {
    fn chunk(&self, content: &str, max_tokens: usize) -> Vec<Chunk> {
        let words: Vec<&str> = content.split_whitespace().collect();
        if words.is_empty() {
            return Vec::new();
        }

        let window = ((max_tokens as f64 / 1.3).floor() as usize).max(1);
        let overlap = self.overlap.min(window / 2);
        let step = window - overlap;

        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + window).min(words.len());
            chunks.push(Chunk::new(chunks.len() as u32, words[start..end].join(" ")));
            if end == words.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

/// Whether a file should be ingested: hidden files and binary or generated
/// artifacts are skipped.
pub fn should_index_file(file_path: &Path) -> bool {
    if let Some(filename) = file_path.file_name().and_then(|n| n.to_str()) {
        if filename.starts_with('.') {
            return false;
        }
    }

    match file_path.extension().and_then(|ext| ext.to_str()) {
        Some("exe") | Some("dll") | Some("so") | Some("dylib") | Some("bin") | Some("o")
        | Some("a") | Some("class") | Some("ico") | Some("wasm") | Some("lock") | Some("zip")
        | Some("gz") | Some("tar") | Some("pdf") => false,

        // Files without extensions - only well-known text files
        None => file_path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| {
                matches!(
                    name,
                    "README" | "CHANGELOG" | "LICENSE" | "Makefile" | "Dockerfile"
                )
            }),

        Some(_) => true,
    }
}

/// Modality of a file, judged by its extension.
pub fn detect_modality(file_path: &Path) -> Modality {
    match file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("webp") | Some("bmp") => {
            Modality::Image
        }
        Some("rs") | Some("py") | Some("js") | Some("ts") | Some("jsx") | Some("tsx")
        | Some("go") | Some("java") | Some("c") | Some("cpp") | Some("h") | Some("hpp")
        | Some("rb") | Some("sh") | Some("sql") | Some("toml") | Some("yaml") | Some("yml")
        | Some("json") => Modality::Code,
        _ => Modality::Text,
    }
}
