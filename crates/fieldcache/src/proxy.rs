use crate::error::{LifecycleError, NetworkError, StorageError};
use crate::policy::FetchPolicy;
use crate::storage::CacheStorage;
use crate::traits::{Clients, Network};
use crate::types::{Request, Response};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Cache generation shipped with this build. Bumping it on deployment is what
/// garbage-collects the previous generation's store on the next activation.
pub const DEFAULT_CACHE_VERSION: &str = "field-planner-v2";

/// Per-generation proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub policy: FetchPolicy,
    /// Request headers that take part in the cache key.
    #[serde(default)]
    pub vary_headers: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            version: default_version(),
            policy: FetchPolicy::default(),
            vary_headers: Vec::new(),
        }
    }
}

fn default_version() -> String {
    DEFAULT_CACHE_VERSION.to_string()
}

/// Lifecycle phase. Each transition happens at most once per proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Installed,
    Activating,
    Activated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::New => "new",
            Phase::Installed => "installed",
            Phase::Activating => "activating",
            Phase::Activated => "activated",
        }
    }
}

/// What the host should do once install completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Activate now instead of waiting for open instances to close.
    SkipWaiting,
}

/// Outcome of the version reconciliation done during activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    /// The current version's store, if it already existed.
    pub retained: Option<String>,
    pub deleted: Vec<String>,
    /// Stores that could not be enumerated or deleted. GC is best-effort.
    pub failed: Vec<String>,
}

/// Where the response handed to the caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Live network response (cache miss).
    Network,
    /// Cached entry served without contacting the network.
    Cache,
    /// Cached entry served while a background refresh runs.
    Stale,
    /// Not eligible for caching, or the proxy is not active yet.
    Bypass,
}

impl ResponseSource {
    /// Value for the `X-Cache` response header.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Network => "MISS",
            ResponseSource::Cache => "HIT",
            ResponseSource::Stale => "STALE",
            ResponseSource::Bypass => "BYPASS",
        }
    }
}

/// Result of one interception.
#[derive(Debug)]
pub struct Fetched {
    pub response: Response,
    pub source: ResponseSource,
    /// Detached store write or revalidation started by this interception.
    /// Dropping the handle does not cancel the task.
    pub background: Option<JoinHandle<()>>,
}

impl Fetched {
    fn immediate(response: Response, source: ResponseSource) -> Self {
        Self {
            response,
            source,
            background: None,
        }
    }

    /// Wait for the background work to finish, then return the response.
    pub async fn settled(self) -> Response {
        if let Some(handle) = self.background {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background cache task failed");
            }
        }
        self.response
    }
}

/// Offline cache proxy for one cache generation.
///
/// Storage and network are shared with other generations and with the
/// background tasks this proxy spawns.
pub struct OfflineProxy<S: CacheStorage, N: Network> {
    settings: ProxySettings,
    storage: Arc<S>,
    network: Arc<N>,
    phase: Mutex<Phase>,
}

impl<S: CacheStorage, N: Network> OfflineProxy<S, N> {
    pub fn new(settings: ProxySettings, storage: Arc<S>, network: Arc<N>) -> Self {
        let vary_headers = settings
            .vary_headers
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        Self {
            settings: ProxySettings {
                vary_headers,
                ..settings
            },
            storage,
            network,
            phase: Mutex::new(Phase::New),
        }
    }

    pub fn version(&self) -> &str {
        &self.settings.version
    }

    pub fn policy(&self) -> FetchPolicy {
        self.settings.policy
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    fn transition(
        &self,
        operation: &'static str,
        from: Phase,
        to: Phase,
    ) -> Result<(), LifecycleError> {
        let mut phase = self.phase.lock();
        if *phase != from {
            return Err(LifecycleError::OutOfOrder {
                operation,
                phase: *phase,
            });
        }
        *phase = to;
        Ok(())
    }

    /// Install hook. No cache work happens here beyond checking that the
    /// storage can hold a store named after the version; on failure the
    /// proxy stays in `New`.
    pub fn install(&self) -> Result<InstallOutcome, LifecycleError> {
        if let Err(e) = self.storage.validate_name(&self.settings.version) {
            tracing::error!(version = %self.settings.version, error = %e, "rejecting cache version");
            return Err(LifecycleError::InvalidVersion(self.settings.version.clone()));
        }
        self.transition("install", Phase::New, Phase::Installed)?;
        tracing::info!(version = %self.settings.version, "proxy installed, skipping wait");
        Ok(InstallOutcome::SkipWaiting)
    }

    /// Activate hook: delete every store but the current version's, then
    /// take control of open instances. Deletion finishes before the claim.
    pub async fn activate<C: Clients>(&self, clients: &C) -> Result<Activation, LifecycleError> {
        self.transition("activate", Phase::Installed, Phase::Activating)?;

        let activation = self.collect_stale_stores().await;
        tracing::info!(
            version = %self.settings.version,
            deleted = ?activation.deleted,
            failed = ?activation.failed,
            "stale cache stores collected"
        );

        self.transition("activate", Phase::Activating, Phase::Activated)?;
        clients.claim();
        tracing::info!(
            version = %self.settings.version,
            policy = %self.settings.policy,
            storage = self.storage.kind(),
            "proxy activated and claimed clients"
        );
        Ok(activation)
    }

    async fn collect_stale_stores(&self) -> Activation {
        let mut activation = Activation::default();

        let names = match self.blocking(|storage| storage.names()).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list cache stores, skipping GC");
                activation.failed.push("*".to_string());
                return activation;
            }
        };

        for name in names {
            if name == self.settings.version {
                activation.retained = Some(name);
                continue;
            }
            let target = name.clone();
            match self.blocking(move |storage| storage.delete(&target)).await {
                Ok(_) => {
                    tracing::debug!(store = %name, "deleted stale cache store");
                    activation.deleted.push(name);
                }
                Err(e) => {
                    tracing::warn!(store = %name, error = %e, "failed to delete stale cache store");
                    activation.failed.push(name);
                }
            }
        }

        activation
    }

    /// Fetch hook: answer one intercepted request according to the policy.
    ///
    /// Errors are network failures that could not be covered by a cached entry.
    pub async fn fetch(&self, request: Request) -> Result<Fetched, NetworkError> {
        if self.phase() != Phase::Activated || !request.is_cacheable() {
            let response = self.network.fetch(&request).await?;
            return Ok(Fetched::immediate(response, ResponseSource::Bypass));
        }

        let key = request.cache_key(&self.settings.vary_headers);
        let cached = self.lookup(&key).await;

        match (self.settings.policy, cached) {
            (FetchPolicy::CacheFirst, Some(hit)) => {
                tracing::debug!(key = %key, "cache HIT");
                Ok(Fetched::immediate(hit, ResponseSource::Cache))
            }
            (FetchPolicy::StaleWhileRevalidate, Some(stale)) => {
                tracing::debug!(key = %key, "serving stale, revalidating");
                let background = self.spawn_revalidation(request, key);
                Ok(Fetched {
                    response: stale,
                    source: ResponseSource::Stale,
                    background: Some(background),
                })
            }
            (_, None) => {
                let response = self.network.fetch(&request).await.inspect_err(|e| {
                    tracing::debug!(key = %key, error = %e, "cache MISS and network failed");
                })?;
                tracing::debug!(key = %key, status = response.status, "cache MISS → network");
                let background = if response.is_success() {
                    Some(self.spawn_store(key, response.clone()))
                } else {
                    None
                };
                Ok(Fetched {
                    response,
                    source: ResponseSource::Network,
                    background,
                })
            }
        }
    }

    /// A store that cannot be read is treated as a miss.
    async fn lookup(&self, key: &str) -> Option<Response> {
        let version = self.settings.version.clone();
        let owned_key = key.to_string();
        match self
            .blocking(move |storage| storage.open(&version).lookup(&owned_key))
            .await
        {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Best-effort write of a successful response; failures are only logged.
    fn spawn_store(&self, key: String, response: Response) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let version = self.settings.version.clone();
        tokio::spawn(async move {
            store_response(storage, version, key, response).await;
        })
    }

    /// Refresh `key` from the network for the next request. Runs to completion
    /// even if the interception that started it goes away.
    fn spawn_revalidation(&self, request: Request, key: String) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let network = Arc::clone(&self.network);
        let version = self.settings.version.clone();
        tokio::spawn(async move {
            match network.fetch(&request).await {
                Ok(fresh) if fresh.is_success() => {
                    store_response(storage, version, key, fresh).await;
                }
                Ok(fresh) => {
                    tracing::debug!(key = %key, status = fresh.status, "revalidation got non-success, keeping stale entry");
                }
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "revalidation failed, keeping stale entry");
                }
            }
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, StorageError> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.storage), f).await
    }
}

async fn run_blocking<S, T, F>(storage: Arc<S>, f: F) -> Result<T, StorageError>
where
    S: CacheStorage,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&storage))
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

async fn store_response<S: CacheStorage>(
    storage: Arc<S>,
    version: String,
    key: String,
    response: Response,
) {
    debug_assert!(response.is_success());
    let result = run_blocking(storage, {
        let key = key.clone();
        move |storage| storage.open(&version).put(&key, &response)
    })
    .await;
    match result {
        Ok(()) => tracing::debug!(key = %key, "cache entry stored"),
        Err(e) => tracing::warn!(key = %key, error = %e, "cache write failed"),
    }
}
