use crate::registration::Registration;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use fieldcache::CacheStorage;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;

/// State for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub registration: Arc<Registration>,
    pub prometheus: PrometheusHandle,
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub name: String,
    pub entries: usize,
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub version: Option<String>,
    pub policy: Option<String>,
    pub phase: Option<&'static str>,
    pub storage: &'static str,
    pub stores: Vec<StoreStats>,
}

impl StatsSnapshot {
    fn collect(registration: &Registration) -> Result<Self, fieldcache::StorageError> {
        let controller = registration.controller();
        let version = controller.as_ref().map(|w| w.version().to_string());
        let storage = registration.storage();

        let mut stores = Vec::new();
        for name in storage.names()? {
            stores.push(StoreStats {
                entries: storage.len(&name)?,
                active: version.as_deref() == Some(name.as_str()),
                name,
            });
        }

        Ok(StatsSnapshot {
            policy: controller.as_ref().map(|w| w.policy().to_string()),
            phase: controller.as_ref().map(|w| w.phase().as_str()),
            version,
            storage: storage.kind(),
            stores,
        })
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

async fn prometheus_handler(State(state): State<AdminState>) -> impl IntoResponse {
    state.prometheus.render()
}

/// GET /api/stats — controlling generation and the stores on disk/in memory.
async fn stats_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let registration = Arc::clone(&state.registration);
    let snapshot = tokio::task::spawn_blocking(move || StatsSnapshot::collect(&registration)).await;

    match snapshot {
        Ok(Ok(snapshot)) => (axum::http::StatusCode::OK, Json(serde_json::json!(snapshot))),
        Ok(Err(e)) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
