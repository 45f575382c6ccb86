//! Versioned offline cache proxy.
//!
//! An [`OfflineProxy`] sits between an application's requests and the network.
//! It goes through three lifecycle hooks (install, activate, fetch) and keeps
//! responses in a named cache store keyed by the current cache version.
//! Activating a new version garbage-collects every other store.

pub mod error;
pub mod policy;
pub mod proxy;
pub mod storage;
pub mod traits;
pub mod types;

pub use error::{LifecycleError, NetworkError, StorageError};
pub use policy::FetchPolicy;
pub use proxy::{
    Activation, Fetched, InstallOutcome, OfflineProxy, Phase, ProxySettings, ResponseSource,
    DEFAULT_CACHE_VERSION,
};
pub use storage::{CacheStorage, DiskStorage, MemoryStorage, Store};
pub use traits::{Clients, Network};
pub use types::{Request, Response};
