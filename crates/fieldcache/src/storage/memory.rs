use super::CacheStorage;
use crate::error::StorageError;
use crate::types::Response;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of shards per store. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 16;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

/// Entries of one named store, spread over independently locked shards so
/// concurrent interceptions for different keys rarely contend.
struct ShardedEntries {
    shards: Box<[RwLock<HashMap<String, Arc<Response>>>]>,
}

impl ShardedEntries {
    fn new() -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    #[inline]
    fn shard_index(key: &str) -> usize {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        (hash & SHARD_MASK) as usize
    }

    fn get(&self, key: &str) -> Option<Arc<Response>> {
        self.shards[Self::shard_index(key)].read().get(key).cloned()
    }

    /// Swaps in the whole response; readers see either the old or the new one.
    fn insert(&self, key: String, value: Response) {
        let idx = Self::shard_index(&key);
        self.shards[idx].write().insert(key, Arc::new(value));
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

/// In-memory cache storage. Contents live as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
    stores: RwLock<HashMap<String, Arc<ShardedEntries>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, name: &str) -> Option<Arc<ShardedEntries>> {
        self.stores.read().get(name).cloned()
    }
}

impl CacheStorage for MemoryStorage {
    fn lookup(&self, store: &str, key: &str) -> Result<Option<Response>, StorageError> {
        Ok(self
            .store(store)
            .and_then(|entries| entries.get(key))
            .map(|resp| resp.as_ref().clone()))
    }

    fn put(&self, store: &str, key: &str, response: &Response) -> Result<(), StorageError> {
        let entries = match self.store(store) {
            Some(entries) => entries,
            None => Arc::clone(
                self.stores
                    .write()
                    .entry(store.to_string())
                    .or_insert_with(|| Arc::new(ShardedEntries::new())),
            ),
        };
        entries.insert(key.to_string(), response.clone());
        Ok(())
    }

    fn names(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.stores.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, store: &str) -> Result<bool, StorageError> {
        Ok(self.stores.write().remove(store).is_some())
    }

    fn len(&self, store: &str) -> Result<usize, StorageError> {
        Ok(self.store(store).map(|entries| entries.len()).unwrap_or(0))
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
