use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Key/value store partitioned by namespace.
///
/// Namespaces are created on first write and dropped as a whole by [`NamespacedMap::clear`].
/// Reads against a namespace that does not exist behave as if it were empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespacedMap {
    data: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl NamespacedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `key` was absent before this write.
    pub fn put(&mut self, ns: &str, key: &str, value: Vec<u8>) -> bool {
        self.data
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value)
            .is_none()
    }

    pub fn get(&self, ns: &str, key: &str) -> Option<&[u8]> {
        self.data.get(ns)?.get(key).map(Vec::as_slice)
    }

    /// Returns `true` when the value was written.
    pub fn put_if_absent(&mut self, ns: &str, key: &str, value: Vec<u8>) -> bool {
        let entries = self.data.entry(ns.to_string()).or_default();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), value);
        true
    }

    pub fn remove(&mut self, ns: &str, key: &str) -> bool {
        self.data
            .get_mut(ns)
            .is_some_and(|entries| entries.remove(key).is_some())
    }

    /// Drops the whole namespace. Returns `false` if it did not exist.
    pub fn clear(&mut self, ns: &str) -> bool {
        self.data.remove(ns).is_some()
    }

    #[cfg(test)]
    pub fn contains_namespace(&self, ns: &str) -> bool {
        self.data.contains_key(ns)
    }
}
