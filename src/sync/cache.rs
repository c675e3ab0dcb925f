// Process-wide asset cache
// Keyed by URL or storage path. Entries are immutable once stored, so the
// cache never needs invalidation or teardown.

use log::debug;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

static ASSET_CACHE: Lazy<AssetCache> = Lazy::new(AssetCache::new);

/// The cache shared by the whole process
pub fn global() -> &'static AssetCache {
    &ASSET_CACHE
}

#[derive(Default)]
pub struct AssetCache {
    entries: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl AssetCache {
    pub fn new() -> Self {
        AssetCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(key).cloned()
    }

    /// Store `value` under `key` and return the cached entry.
    /// The first value stored for a key wins.
    pub fn set(&self, key: &str, value: Vec<u8>) -> Arc<Vec<u8>> {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = entries.get(key) {
            return existing.clone();
        }
        debug!("Caching asset {} ({} bytes)", key, value.len());
        let value = Arc::new(value);
        entries.insert(key.to_string(), value.clone());
        value
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_wins() {
        let cache = AssetCache::new();
        assert!(cache.get("a.json").is_none());

        cache.set("a.json", b"one".to_vec());
        let second = cache.set("a.json", b"two".to_vec());

        assert_eq!(second.as_slice(), b"one");
        assert_eq!(cache.get("a.json").unwrap().as_slice(), b"one");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_global_cache_is_shared() {
        global().set("test_global_cache_is_shared", vec![1, 2, 3]);
        assert_eq!(global().get("test_global_cache_is_shared").unwrap().len(), 3);
    }
}
