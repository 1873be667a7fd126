//! In-memory data structures driven by the replicated log.
//!
//! [`Store`] is a cheap-to-clone handle shared by the state machine (the only writer) and the
//! RPC layer (local reads). Each structure sits behind its own `RwLock`, so readers never wait
//! on the apply path for the other structure and never observe a half-applied command.

pub mod cache;
pub mod map;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockWriteGuard};

pub use cache::{CacheSnapshot, DEFAULT_CACHE_CAPACITY, NamespacedCache};
pub use map::NamespacedMap;

/// Full, serializable image of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub map: NamespacedMap,
    pub cache: CacheSnapshot,
}

#[derive(Debug)]
struct StoreInner {
    map: RwLock<NamespacedMap>,
    cache: RwLock<NamespacedCache>,
}

#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl Store {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                map: RwLock::new(NamespacedMap::new()),
                cache: RwLock::new(NamespacedCache::with_capacity(cache_capacity)),
            }),
        }
    }

    pub async fn map_get(&self, ns: &str, key: &str) -> Option<Vec<u8>> {
        let map = self.inner.map.read().await;
        map.get(ns, key).map(<[u8]>::to_vec)
    }

    /// Cache reads promote the entry, so they take the cache's write guard.
    pub async fn cache_get(&self, ns: &str, key: &str) -> Option<Vec<u8>> {
        let mut cache = self.inner.cache.write().await;
        cache.get(ns, key)
    }

    pub(crate) async fn map_mut(&self) -> RwLockWriteGuard<'_, NamespacedMap> {
        self.inner.map.write().await
    }

    pub(crate) async fn cache_mut(&self) -> RwLockWriteGuard<'_, NamespacedCache> {
        self.inner.cache.write().await
    }

    /// Lock order is always map, then cache.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let map = self.inner.map.read().await;
        let cache = self.inner.cache.read().await;
        StoreSnapshot {
            map: map.clone(),
            cache: cache.snapshot(),
        }
    }

    pub(crate) async fn restore(&self, snapshot: StoreSnapshot) {
        let mut map = self.inner.map.write().await;
        let mut cache = self.inner.cache.write().await;
        *map = snapshot.map;
        *cache = NamespacedCache::restore(snapshot.cache);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn snapshot_restore_round_trips_both_structures() {
        let store = Store::new(2);
        store.map_mut().await.put("m", "k", b"v".to_vec());
        {
            let mut cache = store.cache_mut().await;
            cache.put("c", "a", b"1".to_vec());
            cache.put("c", "b", b"2".to_vec());
        }
        store.cache_get("c", "a").await;

        let snapshot = store.snapshot().await;
        let restored = Store::new(99);
        restored.restore(snapshot.clone()).await;

        assert_eq!(restored.snapshot().await, snapshot);
        assert_eq!(restored.map_get("m", "k").await, Some(b"v".to_vec()));

        restored.cache_mut().await.put("c", "z", b"3".to_vec());
        assert_eq!(restored.cache_get("c", "b").await, None);
        assert_eq!(restored.cache_get("c", "a").await, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn reads_of_absent_values_are_none() {
        let store = Store::default();
        assert_eq!(store.map_get("nope", "k").await, None);
        assert_eq!(store.cache_get("nope", "k").await, None);
    }
}
