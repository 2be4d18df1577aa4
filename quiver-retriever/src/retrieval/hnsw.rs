//! Hierarchical navigable small world (HNSW) graph index.
//!
//! Each node lives on layer 0 and, with exponentially decreasing probability,
//! on higher layers. Searches descend greedily from the top layer and then run
//! a best-first search of width `ef` on layer 0. Recall is traded for latency
//! through `m`, `ef_construction` and `ef_search`; results are approximate.
//!
//! Deletion leaves a tombstone: the node keeps routing traffic but is never
//! returned. [`HnswIndex::build`] creates a fresh graph without tombstones.
//!
//! Vectors of cosine collections are normalized once on insert, so cosine
//! similarity reduces to a dot product at query time.

use crate::storage::{IndexParams, RecordKey};
use quiver_embed::{DistanceMetric, normalize};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    distance: f32,
    node: usize,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.node.cmp(&other.node))
    }
}

#[derive(Debug, Clone)]
struct Node {
    key: RecordKey,
    vector: Vec<f32>,
    seq: u64,
    /// Adjacency list per layer, `neighbors.len() == level + 1`
    neighbors: Vec<Vec<usize>>,
    deleted: bool,
}

/// A search result: the key, how far it is, and when it was inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub key: RecordKey,
    pub distance: f32,
    pub similarity: f32,
    pub seq: u64,
}

/// Fewest tombstones worth an automatic rebuild
pub const MIN_COMPACTION_TOMBSTONES: usize = 64;

/// In-memory HNSW index over the records of one collection.
#[derive(Debug, Clone)]
pub struct HnswIndex {
    metric: DistanceMetric,
    dimension: usize,
    params: IndexParams,
    nodes: Vec<Node>,
    live: HashMap<RecordKey, usize>,
    entry_point: Option<usize>,
    max_level: usize,
    level_mult: f64,
    rng: StdRng,
}

impl HnswIndex {
    pub fn new(metric: DistanceMetric, dimension: usize, params: IndexParams) -> Self {
        Self {
            metric,
            dimension,
            params,
            nodes: Vec::new(),
            live: HashMap::new(),
            entry_point: None,
            max_level: 0,
            level_mult: 1.0 / (params.m.max(2) as f64).ln(),
            rng: StdRng::seed_from_u64(params.seed),
        }
    }

    /// Build a fresh index from `(key, vector, seq)` triples, inserted in
    /// ascending `seq` order.
    pub fn build<I>(metric: DistanceMetric, dimension: usize, params: IndexParams, items: I) -> Self
    where
        I: IntoIterator<Item = (RecordKey, Vec<f32>, u64)>,
    {
        let mut items: Vec<_> = items.into_iter().collect();
        items.sort_by_key(|(_, _, seq)| *seq);

        let mut index = Self::new(metric, dimension, params);
        for (key, vector, seq) in items {
            index.insert(key, &vector, seq);
        }
        index
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> IndexParams {
        self.params
    }

    /// Number of live (non-deleted) entries
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of graph nodes, tombstones included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tombstones(&self) -> usize {
        self.nodes.len() - self.live.len()
    }

    /// Tombstones outnumber live entries and there are at least
    /// [`MIN_COMPACTION_TOMBSTONES`] of them.
    pub fn needs_compaction(&self) -> bool {
        let tombstones = self.tombstones();
        tombstones >= MIN_COMPACTION_TOMBSTONES && tombstones > self.len()
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.live.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.live.keys()
    }

    /// Insert a vector under `key`, replacing any live entry with that key.
    pub fn insert(&mut self, key: RecordKey, vector: &[f32], seq: u64) {
        self.remove(&key);

        let query = self.prepare(vector);
        let level = self.random_level();
        let id = self.nodes.len();
        self.nodes.push(Node {
            key: key.clone(),
            vector: query.clone(),
            seq,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.live.insert(key, id);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_level = level;
            return;
        };

        let mut entry_points = vec![entry];
        for layer in (level + 1..=self.max_level).rev() {
            if let Some(best) = self.search_layer(&query, &entry_points, 1, layer).first() {
                entry_points = vec![best.node];
            }
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates =
                self.search_layer(&query, &entry_points, self.params.ef_construction, layer);
            let selected: Vec<usize> = candidates
                .iter()
                .filter(|c| c.node != id)
                .take(self.params.m)
                .map(|c| c.node)
                .collect();

            let max_links = self.max_links(layer);
            for &neighbor in &selected {
                self.link(neighbor, id, layer, max_links);
            }
            self.nodes[id].neighbors[layer] = selected;

            if !candidates.is_empty() {
                entry_points = candidates.iter().map(|c| c.node).collect();
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }
    }

    /// Tombstone the entry for `key`. Returns whether it was present.
    pub fn remove(&mut self, key: &RecordKey) -> bool {
        match self.live.remove(key) {
            Some(id) => {
                self.nodes[id].deleted = true;
                true
            }
            None => false,
        }
    }

    /// Up to `k` live entries closest to `query` that pass `accept`, ordered
    /// by ascending distance and then by most recent insertion.
    pub fn search<F>(&self, query: &[f32], k: usize, accept: F) -> Vec<Neighbor>
    where
        F: Fn(&RecordKey) -> bool,
    {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 || self.live.is_empty() {
            return Vec::new();
        }

        let query = self.prepare(query);
        let mut entry_points = vec![entry];
        for layer in (1..=self.max_level).rev() {
            if let Some(best) = self.search_layer(&query, &entry_points, 1, layer).first() {
                entry_points = vec![best.node];
            }
        }

        // widen the beam until enough accepted entries turn up or the graph is exhausted
        let mut ef = self.params.ef_search.max(k).min(self.nodes.len());
        loop {
            let candidates = self.search_layer(&query, &entry_points, ef, 0);
            let exhausted = candidates.len() < ef || ef >= self.nodes.len();

            let mut hits: Vec<Neighbor> = candidates
                .into_iter()
                .filter(|c| {
                    let node = &self.nodes[c.node];
                    !node.deleted && accept(&node.key)
                })
                .map(|c| {
                    let node = &self.nodes[c.node];
                    Neighbor {
                        key: node.key.clone(),
                        distance: c.distance,
                        similarity: similarity_from_distance(self.metric, c.distance),
                        seq: node.seq,
                    }
                })
                .collect();

            if hits.len() >= k || exhausted {
                hits.sort_by(|a, b| {
                    a.distance
                        .total_cmp(&b.distance)
                        .then_with(|| b.seq.cmp(&a.seq))
                });
                hits.truncate(k);
                return hits;
            }
            ef = (ef * 2).min(self.nodes.len());
        }
    }

    fn prepare(&self, vector: &[f32]) -> Vec<f32> {
        let mut vector = vector.to_vec();
        if self.metric == DistanceMetric::Cosine {
            normalize(&mut vector);
        }
        vector
    }

    fn random_level(&mut self) -> usize {
        let u: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        ((-u.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        distance(self.metric, a, b)
    }

    /// Add `to` to the adjacency list of `from`, pruning to the closest
    /// `max_links` neighbors when the list overflows.
    fn link(&mut self, from: usize, to: usize, layer: usize, max_links: usize) {
        {
            let links = &mut self.nodes[from].neighbors[layer];
            if links.contains(&to) {
                return;
            }
            links.push(to);
            if links.len() <= max_links {
                return;
            }
        }

        let base = &self.nodes[from].vector;
        let mut scored: Vec<Scored> = self.nodes[from].neighbors[layer]
            .iter()
            .map(|&n| Scored {
                distance: self.distance(base, &self.nodes[n].vector),
                node: n,
            })
            .collect();
        scored.sort();
        scored.truncate(max_links);
        self.nodes[from].neighbors[layer] = scored.into_iter().map(|s| s.node).collect();
    }

    /// Best-first search of one layer. Returns up to `ef` nodes, closest first.
    fn search_layer(&self, query: &[f32], entry_points: &[usize], ef: usize, layer: usize) -> Vec<Scored> {
        let ef = ef.max(1);
        let mut visited: HashSet<usize> = HashSet::with_capacity(ef * 4);
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let scored = Scored {
                distance: self.distance(query, &self.nodes[ep].vector),
                node: ep,
            };
            candidates.push(Reverse(scored));
            results.push(scored);
            if results.len() > ef {
                results.pop();
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.distance > worst.distance {
                    break;
                }
            }

            let Some(links) = self.nodes[current.node].neighbors.get(layer) else {
                continue;
            };
            for &next in links {
                if !visited.insert(next) {
                    continue;
                }
                let distance = self.distance(query, &self.nodes[next].vector);
                let admit = results.len() < ef
                    || results.peek().is_some_and(|worst| distance < worst.distance);
                if admit {
                    let scored = Scored {
                        distance,
                        node: next,
                    };
                    candidates.push(Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }
}

/// Metric-specific distance; lower is closer.
///
/// Cosine expects unit vectors and returns `1 - dot`; inner product returns
/// `-dot`; L2 returns the euclidean distance.
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => 1.0 - dot(a, b),
        DistanceMetric::InnerProduct => -dot(a, b),
        DistanceMetric::L2 => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

/// Map a distance back to a similarity score (higher is more similar).
pub fn similarity_from_distance(metric: DistanceMetric, distance: f32) -> f32 {
    match metric {
        DistanceMetric::Cosine => 1.0 - distance,
        DistanceMetric::InnerProduct => -distance,
        DistanceMetric::L2 => 1.0 / (1.0 + distance),
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> RecordKey {
        RecordKey::from(s)
    }

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect()
    }

    fn brute_force(metric: DistanceMetric, data: &[Vec<f32>], query: &[f32], k: usize) -> Vec<usize> {
        let prep = |v: &[f32]| {
            let mut v = v.to_vec();
            if metric == DistanceMetric::Cosine {
                normalize(&mut v);
            }
            v
        };
        let q = prep(query);
        let mut scored: Vec<(f32, usize)> = data
            .iter()
            .enumerate()
            .map(|(i, v)| (distance(metric, &q, &prep(v)), i))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.into_iter().take(k).map(|(_, i)| i).collect()
    }

    #[test]
    fn test_exact_match_on_small_index() {
        let mut index = HnswIndex::new(DistanceMetric::Cosine, 3, IndexParams::default());
        index.insert(key("a"), &[1.0, 0.0, 0.0], 1);
        index.insert(key("b"), &[0.0, 1.0, 0.0], 2);
        index.insert(key("c"), &[0.0, 0.0, 2.0], 3);

        let hits = index.search(&[1.0, 0.0, 0.0], 1, |_| true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, key("a"));
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_recall_against_brute_force() {
        let dim = 16;
        let data = random_vectors(600, dim, 7);
        let queries = random_vectors(20, dim, 99);

        for metric in [DistanceMetric::Cosine, DistanceMetric::L2] {
            let index = HnswIndex::build(
                metric,
                dim,
                IndexParams::default(),
                data.iter()
                    .enumerate()
                    .map(|(i, v)| (key(&i.to_string()), v.clone(), i as u64)),
            );
            assert_eq!(index.len(), 600);

            let mut found = 0;
            for query in &queries {
                let expected = brute_force(metric, &data, query, 10);
                let hits = index.search(query, 10, |_| true);
                found += hits
                    .iter()
                    .filter(|h| expected.contains(&h.key.as_str().parse::<usize>().unwrap()))
                    .count();
            }
            let recall = found as f64 / (queries.len() * 10) as f64;
            assert!(recall >= 0.9, "recall {recall} too low for {metric}");
        }
    }

    #[test]
    fn test_upsert_and_remove() {
        let mut index = HnswIndex::new(DistanceMetric::Cosine, 3, IndexParams::default());
        index.insert(key("a"), &[1.0, 0.0, 0.0], 1);
        index.insert(key("a"), &[0.0, 1.0, 0.0], 2);

        assert_eq!(index.len(), 1);
        assert_eq!(index.tombstones(), 1);
        let hits = index.search(&[0.0, 1.0, 0.0], 5, |_| true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].seq, 2);

        assert!(index.remove(&key("a")));
        assert!(!index.remove(&key("a")));
        assert!(index.is_empty());
        assert!(index.search(&[0.0, 1.0, 0.0], 5, |_| true).is_empty());
    }

    #[test]
    fn test_ties_prefer_recent_insertions() {
        let mut index = HnswIndex::new(DistanceMetric::L2, 2, IndexParams::default());
        index.insert(key("old"), &[1.0, 1.0], 1);
        index.insert(key("new"), &[1.0, 1.0], 2);
        index.insert(key("far"), &[9.0, 9.0], 3);

        let hits = index.search(&[1.0, 1.0], 3, |_| true);
        let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["new", "old", "far"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_filter_widens_search() {
        let dim = 8;
        let data = random_vectors(300, dim, 3);
        let params = IndexParams::default().with_ef_search(10);
        let index = HnswIndex::build(
            DistanceMetric::L2,
            dim,
            params,
            data.iter()
                .enumerate()
                .map(|(i, v)| (key(&i.to_string()), v.clone(), i as u64)),
        );

        // only every 50th key is acceptable; all six must still be found
        let hits = index.search(&data[0], 6, |k| {
            k.as_str().parse::<usize>().unwrap() % 50 == 0
        });
        assert_eq!(hits.len(), 6);
    }

    #[test]
    fn test_needs_compaction() {
        let mut index = HnswIndex::new(DistanceMetric::Cosine, 3, IndexParams::default());
        for i in 0..MIN_COMPACTION_TOMBSTONES {
            index.insert(key("a"), &[1.0, i as f32, 0.0], i as u64);
        }
        // 63 replaced nodes: not enough yet
        assert_eq!(index.tombstones(), MIN_COMPACTION_TOMBSTONES - 1);
        assert!(!index.needs_compaction());

        index.insert(key("a"), &[1.0, 0.0, 0.0], 1000);
        assert!(index.needs_compaction());

        // plenty of live entries keep the ratio below the trigger
        for i in 0..200 {
            index.insert(key(&format!("k{i}")), &[0.0, 1.0, i as f32], 2000 + i);
        }
        assert!(!index.needs_compaction());
    }

    #[test]
    fn test_rebuild_drops_tombstones() {
        let mut index = HnswIndex::new(DistanceMetric::InnerProduct, 2, IndexParams::default());
        for i in 0..10u64 {
            index.insert(key(&i.to_string()), &[i as f32, 1.0], i);
        }
        for i in 0..5u64 {
            index.remove(&key(&i.to_string()));
        }
        assert_eq!(index.tombstones(), 5);

        let items: Vec<_> = (5..10u64)
            .map(|i| (key(&i.to_string()), vec![i as f32, 1.0], i))
            .collect();
        let rebuilt = HnswIndex::build(
            DistanceMetric::InnerProduct,
            2,
            IndexParams::default().with_m(4),
            items,
        );
        assert_eq!(rebuilt.len(), 5);
        assert_eq!(rebuilt.tombstones(), 0);
        assert_eq!(rebuilt.params().m, 4);

        // inner product favours the largest projection
        let hits = rebuilt.search(&[1.0, 0.0], 1, |_| true);
        assert_eq!(hits[0].key, key("9"));
        assert!((hits[0].similarity - 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_mapping() {
        assert_eq!(similarity_from_distance(DistanceMetric::L2, 0.0), 1.0);
        assert_eq!(similarity_from_distance(DistanceMetric::L2, 1.0), 0.5);
        assert_eq!(similarity_from_distance(DistanceMetric::Cosine, 0.25), 0.75);
        assert_eq!(similarity_from_distance(DistanceMetric::InnerProduct, -2.0), 2.0);
    }
}
