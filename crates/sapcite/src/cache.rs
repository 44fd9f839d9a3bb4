//! Bounded LRU cache for query embeddings.
//!
//! Repeated identical queries skip the embedding provider round-trip.
//! Keys are `(model, query text)` so switching models never serves a
//! stale vector, and entries carry no caller- or classification-
//! specific data, which makes the cache safe to share across callers.
//!
//! Owned by the orchestrator — deliberately not ambient global state.

use std::collections::HashMap;

/// LRU map with a fixed capacity. Recency is tracked with a monotonic
/// counter; eviction removes the least recently used entry.
pub struct EmbeddingCache {
    capacity: usize,
    entries: HashMap<String, (Vec<f32>, u64)>,
    clock: u64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            clock: 0,
        }
    }

    fn key(model: &str, query: &str) -> String {
        format!("{model}\u{1f}{query}")
    }

    /// Fetch a cached vector, refreshing its recency.
    pub fn get(&mut self, model: &str, query: &str) -> Option<Vec<f32>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(&Self::key(model, query)).map(|entry| {
            entry.1 = clock;
            entry.0.clone()
        })
    }

    /// Insert a vector, evicting the least recently used entry when at
    /// capacity. A zero-capacity cache stores nothing.
    pub fn put(&mut self, model: &str, query: &str, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        let key = Self::key(model, query);
        self.clock += 1;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (vector, self.clock));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
