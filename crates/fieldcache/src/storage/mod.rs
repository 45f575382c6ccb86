//! Named cache stores.
//!
//! A [`CacheStorage`] holds any number of named stores, each mapping a request
//! key to the last successful response captured for it. Backends:
//! [`MemoryStorage`] (process lifetime) and [`DiskStorage`] (survives restarts).

mod disk;
mod memory;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

use crate::error::StorageError;
use crate::types::Response;

/// Common interface for cache store backends.
///
/// Calls are synchronous and may block; the proxy runs them on the blocking
/// pool. A store exists once something has been written to it: looking up or
/// opening a missing store does not create it.
pub trait CacheStorage: Send + Sync + 'static {
    /// Look up `key` in `store`. Missing store or key is `Ok(None)`.
    fn lookup(&self, store: &str, key: &str) -> Result<Option<Response>, StorageError>;

    /// Replace the entry for `key` with `response`, creating the store if needed.
    fn put(&self, store: &str, key: &str, response: &Response) -> Result<(), StorageError>;

    /// Names of all existing stores, sorted.
    fn names(&self) -> Result<Vec<String>, StorageError>;

    /// Delete a whole store. Returns whether it existed.
    fn delete(&self, store: &str) -> Result<bool, StorageError>;

    /// Number of entries in `store` (0 if it does not exist).
    fn len(&self, store: &str) -> Result<usize, StorageError>;

    /// Short backend name for logs and stats.
    fn kind(&self) -> &'static str;

    /// Reject store names this backend cannot hold. Accepts everything by default.
    fn validate_name(&self, _store: &str) -> Result<(), StorageError> {
        Ok(())
    }

    /// Handle bound to one named store.
    fn open<'a>(&'a self, name: &'a str) -> Store<'a, Self>
    where
        Self: Sized,
    {
        Store {
            storage: self,
            name,
        }
    }
}

/// A named store inside a [`CacheStorage`].
pub struct Store<'a, S: CacheStorage> {
    storage: &'a S,
    name: &'a str,
}

impl<'a, S: CacheStorage> Store<'a, S> {
    pub fn lookup(&self, key: &str) -> Result<Option<Response>, StorageError> {
        self.storage.lookup(self.name, key)
    }

    pub fn put(&self, key: &str, response: &Response) -> Result<(), StorageError> {
        self.storage.put(self.name, key, response)
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        self.storage.len(self.name)
    }
}
