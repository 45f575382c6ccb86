use crate::registration::Registration;
use fieldcache::{CacheStorage, DiskStorage, FetchPolicy, ProxySettings, DEFAULT_CACHE_VERSION};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub policy: FetchPolicy,
    #[serde(default = "default_vary_headers")]
    pub vary_headers: Vec<String>,
    #[serde(default = "default_storage")]
    pub storage: StorageKind,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no deployment could use. A disk-backed cache names its
    /// store directory after the version, so the version must be a valid
    /// directory name.
    pub fn validate(&self) -> Result<(), fieldcache::StorageError> {
        match self.cache.storage {
            StorageKind::Disk => DiskStorage::new(&self.cache.dir).validate_name(&self.cache.version),
            StorageKind::Memory => Ok(()),
        }
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Settings for one proxy generation.
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            version: self.version.clone(),
            policy: self.policy,
            vary_headers: self.vary_headers.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            policy: FetchPolicy::default(),
            vary_headers: default_vary_headers(),
            storage: default_storage(),
            dir: default_cache_dir(),
        }
    }
}

/// Compare old and new config and apply what can change at runtime.
///
/// - version / policy / vary headers changed → deploy a new proxy generation
///   (install, activate with stale-store GC, claim)
/// - storage backend, cache dir, upstream or listen addresses changed → WARN, ignore
pub fn diff_and_apply(
    old: &Config,
    new: &Config,
    registration: &Arc<Registration>,
    runtime: &tokio::runtime::Handle,
) {
    if old.cache.storage != new.cache.storage || old.cache.dir != new.cache.dir {
        tracing::warn!(
            old = ?old.cache.storage,
            new = ?new.cache.storage,
            "cache storage change detected, ignoring. Restart to switch storage"
        );
    }

    if old.upstream.url != new.upstream.url || old.upstream.timeout_ms != new.upstream.timeout_ms {
        tracing::warn!(
            old = %old.upstream.url,
            new = %new.upstream.url,
            "upstream change detected, ignoring. Restart to switch upstream"
        );
    }

    if old.server.listen_addr != new.server.listen_addr
        || old.server.metrics_addr != new.server.metrics_addr
    {
        tracing::warn!("listen address change detected, ignoring. Restart to rebind");
    }

    let old_settings = old.cache.proxy_settings();
    let new_settings = new.cache.proxy_settings();
    if old_settings != new_settings {
        tracing::info!(
            old_version = %old_settings.version,
            new_version = %new_settings.version,
            old_policy = %old_settings.policy,
            new_policy = %new_settings.policy,
            "config reloaded: deploying new proxy generation"
        );
        // Stamped here, in reload order, so a slow older deploy cannot win.
        let generation = registration.reserve_generation();
        let registration = Arc::clone(registration);
        runtime.spawn(async move {
            if let Err(e) = registration.deploy_generation(generation, new_settings).await {
                tracing::error!(error = %e, "proxy deployment failed");
            }
        });
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_upstream_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_version() -> String {
    DEFAULT_CACHE_VERSION.to_string()
}
fn default_vary_headers() -> Vec<String> {
    vec!["accept-encoding".to_string()]
}
fn default_storage() -> StorageKind {
    StorageKind::Disk
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".fieldcache")
}
