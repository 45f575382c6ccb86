use crate::config::{CacheConfig, StorageKind};
use fieldcache::{CacheStorage, DiskStorage, MemoryStorage, Response, StorageError};

/// Storage backend picked at startup from `cache.storage`.
pub enum StorageBackend {
    Memory(MemoryStorage),
    Disk(DiskStorage),
}

impl StorageBackend {
    pub fn from_config(config: &CacheConfig) -> Self {
        let backend = match config.storage {
            StorageKind::Memory => StorageBackend::Memory(MemoryStorage::new()),
            StorageKind::Disk => StorageBackend::Disk(DiskStorage::new(&config.dir)),
        };
        tracing::info!(
            kind = backend.kind(),
            dir = %config.dir.display(),
            "cache storage initialized"
        );
        backend
    }
}

impl CacheStorage for StorageBackend {
    fn lookup(&self, store: &str, key: &str) -> Result<Option<Response>, StorageError> {
        match self {
            StorageBackend::Memory(s) => s.lookup(store, key),
            StorageBackend::Disk(s) => s.lookup(store, key),
        }
    }

    fn put(&self, store: &str, key: &str, response: &Response) -> Result<(), StorageError> {
        match self {
            StorageBackend::Memory(s) => s.put(store, key, response),
            StorageBackend::Disk(s) => s.put(store, key, response),
        }
    }

    fn names(&self) -> Result<Vec<String>, StorageError> {
        match self {
            StorageBackend::Memory(s) => s.names(),
            StorageBackend::Disk(s) => s.names(),
        }
    }

    fn delete(&self, store: &str) -> Result<bool, StorageError> {
        match self {
            StorageBackend::Memory(s) => s.delete(store),
            StorageBackend::Disk(s) => s.delete(store),
        }
    }

    fn len(&self, store: &str) -> Result<usize, StorageError> {
        match self {
            StorageBackend::Memory(s) => s.len(store),
            StorageBackend::Disk(s) => s.len(store),
        }
    }

    fn validate_name(&self, store: &str) -> Result<(), StorageError> {
        match self {
            StorageBackend::Memory(s) => s.validate_name(store),
            StorageBackend::Disk(s) => s.validate_name(store),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            StorageBackend::Memory(s) => s.kind(),
            StorageBackend::Disk(s) => s.kind(),
        }
    }
}
