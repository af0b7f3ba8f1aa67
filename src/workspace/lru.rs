//! Bounded RAM LRU of named byte ranges for the direct-IO read path.
//!
//! The budget is a hard cap: admitting a new range evicts least-recently-used
//! entries until the new range fits.

use std::collections::HashMap;
use std::sync::Arc;

/// A cached range, shared with readers so eviction never invalidates a view
/// that is still in use.
type CachedRange = Arc<Vec<u8>>;

struct Entry {
    data: CachedRange,
    /// Monotonic use counter; smallest = least recently used.
    last_use: u64,
}

/// LRU cache of byte ranges keyed by name.
pub struct RangeLru {
    budget: usize,
    used: usize,
    tick: u64,
    entries: HashMap<String, Entry>,
}

impl RangeLru {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    /// Look up a range, marking it most recently used.
    pub fn get(&mut self, name: &str) -> Option<CachedRange> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(name).map(|entry| {
            entry.last_use = tick;
            entry.data.clone()
        })
    }

    /// Admit a range, evicting older entries until it fits.
    ///
    /// Ranges larger than the whole budget are returned uncached rather than
    /// flushing everything for a single oversized read.
    pub fn insert(&mut self, name: &str, data: Vec<u8>) -> CachedRange {
        let data = Arc::new(data);
        if data.len() > self.budget {
            return data;
        }

        if let Some(old) = self.entries.remove(name) {
            self.used -= old.data.len();
        }

        while self.used + data.len() > self.budget {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_use)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    if let Some(e) = self.entries.remove(&key) {
                        self.used -= e.data.len();
                    }
                }
                None => break,
            }
        }

        self.tick += 1;
        self.used += data.len();
        self.entries.insert(
            name.to_string(),
            Entry {
                data: data.clone(),
                last_use: self.tick,
            },
        );
        data
    }

    /// Drop every cached range whose name starts with `prefix`.
    pub fn evict_prefix(&mut self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let mut freed = 0;
        for key in keys {
            if let Some(e) = self.entries.remove(&key) {
                freed += e.data.len();
                self.used -= e.data.len();
            }
        }
        freed
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut lru = RangeLru::new(100);
        lru.insert("a", vec![1u8; 40]);
        assert_eq!(lru.get("a").unwrap().len(), 40);
        assert!(lru.get("b").is_none());
    }

    #[test]
    fn test_budget_is_hard_cap() {
        let mut lru = RangeLru::new(100);
        lru.insert("a", vec![0u8; 40]);
        lru.insert("b", vec![0u8; 40]);
        lru.insert("c", vec![0u8; 40]);

        assert!(lru.used() <= 100);
        // "a" was least recently used and should have been evicted.
        assert!(lru.get("a").is_none());
        assert!(lru.get("c").is_some());
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut lru = RangeLru::new(100);
        lru.insert("a", vec![0u8; 40]);
        lru.insert("b", vec![0u8; 40]);
        lru.get("a");
        lru.insert("c", vec![0u8; 40]);

        // "b" is now the LRU victim, not "a".
        assert!(lru.get("a").is_some());
        assert!(lru.get("b").is_none());
    }

    #[test]
    fn test_oversized_bypasses_cache() {
        let mut lru = RangeLru::new(100);
        lru.insert("small", vec![0u8; 40]);
        let big = lru.insert("big", vec![0u8; 500]);
        assert_eq!(big.len(), 500);
        assert!(lru.get("big").is_none());
        assert!(lru.get("small").is_some());
    }

    #[test]
    fn test_evict_prefix() {
        let mut lru = RangeLru::new(1000);
        lru.insert("layer.0.k", vec![0u8; 10]);
        lru.insert("layer.0.v", vec![0u8; 10]);
        lru.insert("layer.1.k", vec![0u8; 10]);

        let freed = lru.evict_prefix("layer.0");
        assert_eq!(freed, 20);
        assert_eq!(lru.len(), 1);
    }
}
