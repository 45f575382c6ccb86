use crate::config::{CacheConfig, StorageKind};
use crate::metrics::{admin_router, AdminState};
use crate::proxy_router;
use crate::registration::Registration;
use crate::storage::StorageBackend;
use crate::upstream::UpstreamNetwork;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use fieldcache::{CacheStorage, FetchPolicy, ProxySettings};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Trip-planner origin on a random local port. Every hit on the trip page
/// bumps its revision.
struct Upstream {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Upstream {
    async fn start() -> Self {
        let revision = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/trips/alps.html",
                get(move || {
                    let revision = Arc::clone(&revision);
                    async move {
                        let n = revision.fetch_add(1, Ordering::SeqCst) + 1;
                        ([("content-type", "text/html")], format!("<h1>Alps rev {n}</h1>"))
                    }
                }),
            )
            .route(
                "/gone.html",
                get(|| async { (StatusCode::NOT_FOUND, "gone") }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let handle = tokio::spawn(async move {
            server.await.ok();
        });

        Self {
            addr,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

async fn deployed(upstream: &Upstream, settings: ProxySettings) -> Arc<Registration> {
    let config = CacheConfig {
        storage: StorageKind::Memory,
        ..CacheConfig::default()
    };
    let storage = Arc::new(StorageBackend::from_config(&config));
    let network = Arc::new(UpstreamNetwork::new(
        &format!("http://{}", upstream.addr),
        Duration::from_secs(5),
    ));
    let registration = Arc::new(Registration::new(storage, network));
    registration
        .deploy(settings)
        .await
        .unwrap()
        .expect("nothing else was deploying");
    registration
}

async fn send(router: &Router, method: &str, path: &str) -> (StatusCode, HeaderMap, String) {
    let req = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

fn x_cache(headers: &HeaderMap) -> &str {
    headers
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Poll until `check` holds; background cache writes are detached.
async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn cached_body(registration: &Registration, version: &str, path: &str) -> Option<String> {
    let key = fieldcache::Request::get(path).cache_key(&["accept-encoding".to_string()]);
    registration
        .storage()
        .lookup(version, &key)
        .unwrap()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
}

#[tokio::test]
async fn stale_while_revalidate_end_to_end() {
    let upstream = Upstream::start().await;
    let settings = CacheConfig::default().proxy_settings();
    let version = settings.version.clone();
    let registration = deployed(&upstream, settings).await;
    let router = proxy_router(Arc::clone(&registration));

    let (status, headers, body) = send(&router, "GET", "/trips/alps.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(x_cache(&headers), "MISS");
    assert_eq!(headers.get("x-cache-version").unwrap(), version.as_str());
    assert_eq!(headers.get("content-type").unwrap(), "text/html");
    assert_eq!(body, "<h1>Alps rev 1</h1>");
    eventually(|| cached_body(&registration, &version, "/trips/alps.html").is_some()).await;

    // Served stale, refreshed behind the caller's back.
    let (_, headers, body) = send(&router, "GET", "/trips/alps.html").await;
    assert_eq!(x_cache(&headers), "STALE");
    assert_eq!(body, "<h1>Alps rev 1</h1>");
    eventually(|| {
        cached_body(&registration, &version, "/trips/alps.html").as_deref()
            == Some("<h1>Alps rev 2</h1>")
    })
    .await;

    let (_, _, body) = send(&router, "GET", "/trips/alps.html").await;
    assert_eq!(body, "<h1>Alps rev 2</h1>");

    upstream.stop().await;

    let (status, headers, body) = send(&router, "GET", "/trips/alps.html").await;
    assert_eq!(status, StatusCode::OK, "offline visit must see last known good content");
    assert_eq!(x_cache(&headers), "STALE");
    assert!(body.starts_with("<h1>Alps rev"), "{body}");

    let (status, _, _) = send(&router, "GET", "/trips/never-visited.html").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn cache_first_serves_hits_without_upstream() {
    let upstream = Upstream::start().await;
    let settings = ProxySettings {
        policy: FetchPolicy::CacheFirst,
        ..CacheConfig::default().proxy_settings()
    };
    let version = settings.version.clone();
    let registration = deployed(&upstream, settings).await;
    let router = proxy_router(Arc::clone(&registration));

    send(&router, "GET", "/trips/alps.html").await;
    eventually(|| cached_body(&registration, &version, "/trips/alps.html").is_some()).await;

    let (_, headers, body) = send(&router, "GET", "/trips/alps.html").await;
    assert_eq!(x_cache(&headers), "HIT");
    assert_eq!(body, "<h1>Alps rev 1</h1>");

    upstream.stop().await;
    let (_, headers, body) = send(&router, "GET", "/trips/alps.html").await;
    assert_eq!(x_cache(&headers), "HIT");
    assert_eq!(body, "<h1>Alps rev 1</h1>");
}

#[tokio::test]
async fn failures_and_non_get_are_not_cached() {
    let upstream = Upstream::start().await;
    let settings = CacheConfig::default().proxy_settings();
    let version = settings.version.clone();
    let registration = deployed(&upstream, settings).await;
    let router = proxy_router(Arc::clone(&registration));

    let (status, headers, _) = send(&router, "GET", "/gone.html").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(x_cache(&headers), "MISS");

    let (status, headers, _) = send(&router, "POST", "/trips/alps.html").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(x_cache(&headers), "BYPASS");

    assert_eq!(registration.storage().len(&version).unwrap(), 0);
    upstream.stop().await;
}

#[tokio::test]
async fn redeploy_collects_previous_generation() {
    let upstream = Upstream::start().await;
    let v1 = ProxySettings {
        version: "field-planner-v1".to_string(),
        ..CacheConfig::default().proxy_settings()
    };
    let registration = deployed(&upstream, v1).await;
    let router = proxy_router(Arc::clone(&registration));

    send(&router, "GET", "/trips/alps.html").await;
    eventually(|| cached_body(&registration, "field-planner-v1", "/trips/alps.html").is_some())
        .await;

    let v2 = ProxySettings {
        version: "field-planner-v2".to_string(),
        ..CacheConfig::default().proxy_settings()
    };
    let activation = registration.deploy(v2).await.unwrap().unwrap();
    assert_eq!(activation.deleted, vec!["field-planner-v1"]);
    assert!(registration.storage().names().unwrap().is_empty());

    // The already-open router is governed by the new generation without a rebuild.
    let (_, headers, body) = send(&router, "GET", "/trips/alps.html").await;
    assert_eq!(x_cache(&headers), "MISS");
    assert_eq!(headers.get("x-cache-version").unwrap(), "field-planner-v2");
    assert_eq!(body, "<h1>Alps rev 2</h1>");
    upstream.stop().await;
}

#[tokio::test]
async fn superseded_deploy_never_takes_control() {
    let upstream = Upstream::start().await;
    let registration = deployed(&upstream, CacheConfig::default().proxy_settings()).await;

    let older = registration.deploy(ProxySettings {
        version: "field-planner-v3".to_string(),
        ..CacheConfig::default().proxy_settings()
    });
    let newer = registration.deploy(ProxySettings {
        version: "field-planner-v4".to_string(),
        ..CacheConfig::default().proxy_settings()
    });
    let (older, newer) = tokio::join!(older, newer);

    assert_eq!(older, Ok(None));
    assert!(newer.unwrap().is_some());
    let controller = registration.controller().unwrap();
    assert_eq!(controller.version(), "field-planner-v4");
    upstream.stop().await;
}

#[tokio::test]
async fn stats_report_active_generation_and_stores() {
    let upstream = Upstream::start().await;
    let settings = CacheConfig::default().proxy_settings();
    let version = settings.version.clone();
    let registration = deployed(&upstream, settings).await;
    let router = proxy_router(Arc::clone(&registration));
    send(&router, "GET", "/trips/alps.html").await;
    eventually(|| cached_body(&registration, &version, "/trips/alps.html").is_some()).await;

    let admin = admin_router(AdminState {
        registration: Arc::clone(&registration),
        prometheus: metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle(),
    });
    let (status, _, body) = send(&admin, "GET", "/api/stats").await;
    assert_eq!(status, StatusCode::OK);

    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["version"], version.as_str());
    assert_eq!(stats["policy"], "stale-while-revalidate");
    assert_eq!(stats["phase"], "activated");
    assert_eq!(stats["storage"], "memory");
    assert_eq!(stats["stores"][0]["name"], version.as_str());
    assert_eq!(stats["stores"][0]["entries"], 1);
    assert_eq!(stats["stores"][0]["active"], true);
    upstream.stop().await;
}
