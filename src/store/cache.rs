use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::codec::base64_bytes;

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    stamp: u64,
}

/// One namespace of the cache: a fixed-capacity map with least-recently-used eviction.
///
/// Recency is tracked with a monotonically increasing stamp per access; `recency` maps the
/// stamp back to its key so the oldest entry is always `recency.first_key_value()`.
#[derive(Debug, Clone)]
struct LruNamespace {
    capacity: usize,
    next_stamp: u64,
    entries: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
}

impl LruNamespace {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_stamp: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    fn touch(&mut self, key: &str) {
        let stamp = self.stamp();
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.stamp);
            slot.stamp = stamp;
            self.recency.insert(stamp, key.to_string());
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> bool {
        if let Some(slot) = self.entries.get_mut(key) {
            slot.value = value;
            self.touch(key);
            return false;
        }

        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        let stamp = self.stamp();
        self.entries.insert(key.to_string(), Slot { value, stamp });
        self.recency.insert(stamp, key.to_string());
        true
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let value = self.entries.get(key)?.value.clone();
        self.touch(key);
        Some(value)
    }

    #[cfg(test)]
    fn peek(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|slot| slot.value.as_slice())
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.recency.remove(&slot.stamp);
                true
            }
            None => false,
        }
    }

    /// Entries ordered from least to most recently used.
    fn ordered(&self) -> Vec<CacheEntry> {
        self.recency
            .values()
            .filter_map(|key| {
                self.entries.get(key).map(|slot| CacheEntry {
                    key: key.clone(),
                    value: slot.value.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

/// Serializable image of a [`NamespacedCache`], including recency order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub capacity: usize,
    /// Per namespace, entries ordered from least to most recently used.
    pub namespaces: BTreeMap<String, Vec<CacheEntry>>,
}

/// Bounded key/value store partitioned by namespace. Eviction never crosses namespaces.
#[derive(Debug, Clone)]
pub struct NamespacedCache {
    capacity: usize,
    namespaces: BTreeMap<String, LruNamespace>,
}

impl Default for NamespacedCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl NamespacedCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            namespaces: BTreeMap::new(),
        }
    }

    /// Returns `true` when `key` was absent before this write. May evict the namespace's
    /// least-recently-used entry.
    pub fn put(&mut self, ns: &str, key: &str, value: Vec<u8>) -> bool {
        let capacity = self.capacity;
        self.namespaces
            .entry(ns.to_string())
            .or_insert_with(|| LruNamespace::new(capacity))
            .put(key, value)
    }

    /// Reads a value and promotes it to most-recently-used.
    pub fn get(&mut self, ns: &str, key: &str) -> Option<Vec<u8>> {
        self.namespaces.get_mut(ns)?.get(key)
    }

    /// Reads a value without touching recency.
    #[cfg(test)]
    pub fn peek(&self, ns: &str, key: &str) -> Option<&[u8]> {
        self.namespaces.get(ns)?.peek(key)
    }

    /// Skipped only when the namespace is absent.
    pub fn remove(&mut self, ns: &str, key: &str) -> bool {
        let Some(namespace) = self.namespaces.get_mut(ns) else {
            return false;
        };
        namespace.remove(key)
    }

    pub fn clear(&mut self, ns: &str) -> bool {
        self.namespaces.remove(ns).is_some()
    }

    #[cfg(test)]
    pub fn len(&self, ns: &str) -> usize {
        self.namespaces.get(ns).map_or(0, |n| n.entries.len())
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            capacity: self.capacity,
            namespaces: self
                .namespaces
                .iter()
                .map(|(name, ns)| (name.clone(), ns.ordered()))
                .collect(),
        }
    }

    /// Rebuilds a cache by replaying each namespace's entries oldest first, which reproduces
    /// the captured eviction order.
    pub fn restore(snapshot: CacheSnapshot) -> Self {
        let mut cache = Self::with_capacity(snapshot.capacity);
        let capacity = cache.capacity;
        for (name, entries) in snapshot.namespaces {
            let ns = cache
                .namespaces
                .entry(name)
                .or_insert_with(|| LruNamespace::new(capacity));
            for entry in entries {
                ns.put(&entry.key, entry.value);
            }
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn keys(cache: &NamespacedCache, ns: &str) -> Vec<String> {
        cache
            .snapshot()
            .namespaces
            .get(ns)
            .map(|entries| entries.iter().map(|e| e.key.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let mut cache = NamespacedCache::with_capacity(3);
        for k in ["a", "b", "c"] {
            assert!(cache.put("ns", k, k.as_bytes().to_vec()));
        }
        cache.put("ns", "d", b"d".to_vec());

        assert_eq!(cache.len("ns"), 3);
        assert_eq!(cache.peek("ns", "a"), None);
        assert_eq!(keys(&cache, "ns"), vec!["b", "c", "d"]);
    }

    #[test]
    fn get_protects_entry_from_eviction() {
        let mut cache = NamespacedCache::with_capacity(3);
        for k in ["a", "b", "c"] {
            cache.put("ns", k, k.as_bytes().to_vec());
        }
        assert_eq!(cache.get("ns", "a"), Some(b"a".to_vec()));
        cache.put("ns", "d", b"d".to_vec());

        assert_eq!(cache.peek("ns", "a"), Some(&b"a"[..]));
        assert_eq!(cache.peek("ns", "b"), None);
        assert_eq!(keys(&cache, "ns"), vec!["c", "a", "d"]);
    }

    #[test]
    fn overwrite_refreshes_recency_without_growing() {
        let mut cache = NamespacedCache::with_capacity(2);
        cache.put("ns", "a", b"1".to_vec());
        cache.put("ns", "b", b"2".to_vec());
        assert!(!cache.put("ns", "a", b"3".to_vec()));
        cache.put("ns", "c", b"4".to_vec());

        assert_eq!(cache.peek("ns", "a"), Some(&b"3"[..]));
        assert_eq!(cache.peek("ns", "b"), None);
    }

    #[test]
    fn eviction_is_local_to_namespace() {
        let mut cache = NamespacedCache::with_capacity(1);
        cache.put("one", "a", b"1".to_vec());
        cache.put("two", "b", b"2".to_vec());

        assert_eq!(cache.peek("one", "a"), Some(&b"1"[..]));
        assert_eq!(cache.peek("two", "b"), Some(&b"2"[..]));
    }

    #[test]
    fn remove_works_when_namespace_present() {
        let mut cache = NamespacedCache::with_capacity(4);
        cache.put("ns", "k", b"v".to_vec());

        assert!(cache.remove("ns", "k"));
        assert_eq!(cache.get("ns", "k"), None);
        assert!(!cache.remove("ns", "k"));
        assert!(!cache.remove("missing", "k"));
    }

    #[test]
    fn clear_reports_existence() {
        let mut cache = NamespacedCache::with_capacity(4);
        cache.put("ns", "k", b"v".to_vec());

        assert!(cache.clear("ns"));
        assert_eq!(cache.get("ns", "k"), None);
        assert!(!cache.clear("ns"));
    }

    #[test]
    fn restore_reproduces_eviction_order() {
        let mut cache = NamespacedCache::with_capacity(3);
        for k in ["a", "b", "c"] {
            cache.put("ns", k, k.as_bytes().to_vec());
        }
        cache.get("ns", "a");

        let mut restored = NamespacedCache::restore(cache.snapshot());
        assert_eq!(restored.snapshot(), cache.snapshot());

        restored.put("ns", "d", b"d".to_vec());
        cache.put("ns", "d", b"d".to_vec());
        assert_eq!(restored.snapshot(), cache.snapshot());
        assert_eq!(restored.peek("ns", "b"), None);
    }
}
