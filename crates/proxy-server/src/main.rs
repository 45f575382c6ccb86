mod config;
mod metrics;
mod proxy;
mod registration;
mod storage;
mod upstream;

#[cfg(test)]
mod tests;

use axum::routing::any;
use axum::Router;
use clap::Parser;
use config::Config;
use crate::metrics::{admin_router, AdminState};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use proxy::proxy_handler;
use registration::Registration;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::StorageBackend;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use upstream::UpstreamNetwork;

/// Offline cache proxy for the field planner.
#[derive(Parser)]
#[command(name = "fieldcache-proxy")]
struct Args {
    /// Path to the TOML config file (watched for changes)
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

/// Proxy router: every path is intercepted.
fn proxy_router(registration: Arc<Registration>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(registration)
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();
    let config = load_config(&args.config);

    // Install Prometheus metrics recorder
    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    let storage = Arc::new(StorageBackend::from_config(&config.cache));
    let network = Arc::new(UpstreamNetwork::new(
        &config.upstream.url,
        Duration::from_millis(config.upstream.timeout_ms),
    ));
    let registration = Arc::new(Registration::new(storage, network));

    match registration.deploy(config.cache.proxy_settings()).await {
        Ok(Some(activation)) => tracing::info!(
            retained = ?activation.retained,
            deleted = activation.deleted.len(),
            failed = activation.failed.len(),
            "initial proxy generation active"
        ),
        Ok(None) => tracing::warn!("initial deployment superseded before it started"),
        Err(e) => tracing::error!(error = %e, "initial deployment failed, passing traffic through"),
    }

    let shutdown = CancellationToken::new();

    let proxy_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        version = %config.cache.version,
        policy = %config.cache.policy,
        "fieldcache proxy starting"
    );

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind proxy to {proxy_addr}: {e}"));

    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind metrics to {metrics_addr}: {e}"));

    // Keep the watcher alive until shutdown
    let _watcher = spawn_config_watcher(args.config.clone(), config, Arc::clone(&registration));

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let admin = admin_router(AdminState {
        registration: Arc::clone(&registration),
        prometheus: prom_handle,
    });

    let proxy_future = axum::serve(proxy_listener, proxy_router(registration))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let metrics_future = axum::serve(metrics_listener, admin)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    tracing::info!("fieldcache proxy shut down");
}

fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found, using defaults");
        return Config::default_config();
    }
    match Config::load(path) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "loaded config");
            c
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to load config, using defaults");
            Config::default_config()
        }
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch the config file and deploy a new proxy generation when the cache
/// settings change. Returns the watcher, which stops when dropped.
fn spawn_config_watcher(
    config_path: PathBuf,
    initial_config: Config,
    registration: Arc<Registration>,
) -> Option<notify::RecommendedWatcher> {
    let current_config = Arc::new(Mutex::new(initial_config));
    let runtime = tokio::runtime::Handle::current();

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let mut old = current_config.lock();
                        config::diff_and_apply(&old, &new_config, &registration, &runtime);
                        *old = new_config;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return None;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, path = %config_path.display(), "failed to watch config file");
        return None;
    }

    tracing::info!(path = %config_path.display(), "config file watcher started");
    Some(watcher)
}
