//! Content-addressed embedding cache.
//!
//! Entries are keyed by `(model, content hash)`. The hash is blake3 over the
//! normalized content, so identical content embedded with the same model hits
//! the cache no matter which document or chunk it came from.
//!
//! The cache is bounded and evicts the least recently used entry. Entries can
//! be pinned while an ingestion item is in flight; pinned entries are skipped
//! by eviction. A miss is never an error: callers fall back to the provider.

use crate::registry::Modality;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// blake3 hash of normalized content (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash content after normalizing it for its modality.
    ///
    /// Text-like content has every whitespace run collapsed to one space and
    /// is trimmed; image content is hashed as-is. The modality is mixed into
    /// the hash so a caption and an image with the same bytes do not collide.
    pub fn compute(modality: Modality, content: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(modality.as_str().as_bytes());
        hasher.update(&[0]);
        if modality.is_textual() {
            let mut first = true;
            for word in content.split_whitespace() {
                if !first {
                    hasher.update(b" ");
                }
                hasher.update(word.as_bytes());
                first = false;
            }
        } else {
            hasher.update(content.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

type CacheKey = (String, ContentHash);

#[derive(Debug)]
struct Entry {
    vector: Vec<f32>,
    tick: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Entry>,
    /// Recency order: oldest tick first
    order: BTreeMap<u64, CacheKey>,
    /// In-flight reference counts; a key may be pinned before it is inserted
    pins: HashMap<CacheKey, usize>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &CacheKey) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    fn evict_excess(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let victim = self
                .order
                .iter()
                .find(|(_, key)| !self.pins.contains_key(*key))
                .map(|(tick, key)| (*tick, key.clone()));

            match victim {
                Some((tick, key)) => {
                    self.order.remove(&tick);
                    self.entries.remove(&key);
                    self.evictions += 1;
                }
                // Everything left is pinned; retry once pins are released.
                None => break,
            }
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub pinned: usize,
    pub hit_rate: f64,
}

/// Bounded LRU cache of embeddings, safe to share across workers.
///
/// All operations take a short internal lock and never block on I/O.
#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a vector, refreshing its recency on a hit.
    pub fn get(&self, model: &str, hash: &ContentHash) -> Option<Vec<f32>> {
        let key = (model.to_string(), *hash);
        let mut inner = self.lock();
        if inner.entries.contains_key(&key) {
            inner.hits += 1;
            inner.touch(&key);
            inner.entries.get(&key).map(|e| e.vector.clone())
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Insert or replace a vector, evicting least recently used entries.
    pub fn put(&self, model: &str, hash: ContentHash, vector: Vec<f32>) {
        let key = (model.to_string(), hash);
        let mut inner = self.lock();
        let tick = inner.next_tick;
        inner.next_tick += 1;

        if let Some(old) = inner.entries.insert(key.clone(), Entry { vector, tick }) {
            inner.order.remove(&old.tick);
        }
        inner.order.insert(tick, key);
        inner.evict_excess(self.capacity);
    }

    /// Pin keys so eviction skips them until the returned guard is dropped.
    pub fn pin<I>(&self, model: &str, hashes: I) -> CachePin<'_>
    where
        I: IntoIterator<Item = ContentHash>,
    {
        let keys: Vec<CacheKey> = hashes
            .into_iter()
            .map(|hash| (model.to_string(), hash))
            .collect();

        let mut inner = self.lock();
        for key in &keys {
            *inner.pins.entry(key.clone()).or_insert(0) += 1;
        }
        drop(inner);

        CachePin { cache: self, keys }
    }

    fn unpin(&self, keys: &[CacheKey]) {
        let mut inner = self.lock();
        for key in keys {
            if let Some(count) = inner.pins.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    inner.pins.remove(key);
                }
            }
        }
        inner.evict_excess(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Pins and counters are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
        tracing::info!("Embedding cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            pinned: inner.pins.len(),
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// RAII guard returned by [`EmbeddingCache::pin`].
#[derive(Debug)]
pub struct CachePin<'a> {
    cache: &'a EmbeddingCache,
    keys: Vec<CacheKey>,
}

impl Drop for CachePin<'_> {
    fn drop(&mut self) {
        self.cache.unpin(&self.keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn hash(text: &str) -> ContentHash {
        ContentHash::compute(Modality::Text, text)
    }

    #[test]
    fn test_hash_normalizes_whitespace() {
        assert_eq!(hash("hello   world\n"), hash("  hello world"));
        assert_ne!(hash("hello world"), hash("hello-world"));
        assert_ne!(
            ContentHash::compute(Modality::Text, "abc"),
            ContentHash::compute(Modality::Caption, "abc")
        );
        // image content is not normalized
        assert_ne!(
            ContentHash::compute(Modality::Image, "a b"),
            ContentHash::compute(Modality::Image, "a  b")
        );
    }

    #[test]
    fn test_hex_rendering() {
        let bytes = *blake3::hash(b"quiver").as_bytes();
        let hash = ContentHash::from_bytes(bytes);
        assert_eq!(hash.to_hex(), blake3::Hash::from(bytes).to_hex().as_str());
        assert_eq!(hash.to_hex().len(), 64);
        assert_eq!(hash.to_string(), hash.to_hex());
        assert_eq!(format!("{hash:?}"), format!("ContentHash({})", &hash.to_hex()[..12]));
    }

    #[test]
    fn test_get_put_and_stats() {
        let cache = EmbeddingCache::new(4);
        assert_eq!(cache.get("m1", &hash("a")), None);

        cache.put("m1", hash("a"), vec![1.0, 2.0]);
        assert_eq!(cache.get("m1", &hash("a")), Some(vec![1.0, 2.0]));
        // same content, different model: separate entry
        assert_eq!(cache.get("m2", &hash("a")), None);

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = EmbeddingCache::new(2);
        cache.put("m", hash("a"), vec![1.0]);
        cache.put("m", hash("b"), vec![2.0]);

        // refresh "a" so "b" becomes least recently used
        assert!(cache.get("m", &hash("a")).is_some());
        cache.put("m", hash("c"), vec![3.0]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("m", &hash("a")).is_some());
        assert!(cache.get("m", &hash("b")).is_none());
        assert!(cache.get("m", &hash("c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let cache = EmbeddingCache::new(2);
        cache.put("m", hash("a"), vec![1.0]);
        cache.put("m", hash("a"), vec![9.0]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("m", &hash("a")), Some(vec![9.0]));
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let cache = EmbeddingCache::new(1);
        cache.put("m", hash("a"), vec![1.0]);

        let pin = cache.pin("m", [hash("a")]);
        cache.put("m", hash("b"), vec![2.0]);

        // "a" is pinned, so "b" (the only unpinned entry) was evicted instead
        assert!(cache.get("m", &hash("a")).is_some());
        assert!(cache.get("m", &hash("b")).is_none());
        assert_eq!(cache.stats().pinned, 1);

        drop(pin);
        assert_eq!(cache.stats().pinned, 0);
        cache.put("m", hash("c"), vec![3.0]);
        assert!(cache.get("m", &hash("a")).is_none());
        assert!(cache.get("m", &hash("c")).is_some());
    }

    #[test]
    fn test_pin_before_put_and_overflow() {
        let cache = EmbeddingCache::new(1);
        let pin = cache.pin("m", [hash("a"), hash("b")]);
        cache.put("m", hash("a"), vec![1.0]);
        cache.put("m", hash("b"), vec![2.0]);

        // both pinned: capacity temporarily exceeded
        assert_eq!(cache.len(), 2);
        drop(pin);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(EmbeddingCache::new(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let h = hash(&format!("item-{}", (t * 100 + i) % 128));
                        if cache.get("m", &h).is_none() {
                            cache.put("m", h, vec![i as f32]);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 64);
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 800);
    }
}
