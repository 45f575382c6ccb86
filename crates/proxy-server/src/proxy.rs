use crate::registration::Registration;
use crate::upstream::is_hop_by_hop;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request as HttpRequest, Response as HttpResponse, StatusCode};
use fieldcache::{Fetched, Network, Request, ResponseSource};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Instant;

/// Main proxy handler. Every request is intercepted by the controlling proxy
/// generation; with none in control it goes straight to the upstream.
pub async fn proxy_handler(
    State(registration): State<Arc<Registration>>,
    req: HttpRequest<Body>,
) -> HttpResponse<Body> {
    let start = Instant::now();
    let request = match into_request(req).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };
    let url = request.url.clone();

    let controller = registration.controller();
    let version = controller.as_ref().map(|w| w.version().to_string());
    let result = match &controller {
        Some(worker) => worker.fetch(request).await,
        None => registration
            .network()
            .fetch(&request)
            .await
            .map(|response| Fetched {
                response,
                source: ResponseSource::Bypass,
                background: None,
            }),
    };

    match result {
        Ok(fetched) => {
            let source = fetched.source;
            metrics::counter!("fieldcache_responses_total", "source" => source.as_str())
                .increment(1);
            tracing::debug!(
                url = %url,
                status = fetched.response.status,
                cache = source.as_str(),
                latency_us = start.elapsed().as_micros(),
                "request served"
            );
            build_response(fetched, version.as_deref())
        }
        Err(e) => {
            metrics::counter!("fieldcache_network_failures_total").increment(1);
            tracing::warn!(url = %url, error = %e, "no cached entry to fall back on");
            error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

/// Convert an incoming HTTP request into the proxy's request descriptor.
/// The URL keeps only path and query: the proxy serves one origin.
async fn into_request(req: HttpRequest<Body>) -> Result<Request, axum::Error> {
    let (parts, body) = req.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let body = body.collect().await?.to_bytes();

    Ok(Request {
        method: parts.method.to_string(),
        url,
        headers,
        body,
    })
}

/// Build the HTTP response, tagging where it came from.
fn build_response(fetched: Fetched, version: Option<&str>) -> HttpResponse<Body> {
    let Fetched {
        response, source, ..
    } = fetched;
    let mut builder = HttpResponse::builder().status(response.status);

    for (key, value) in &response.headers {
        if is_hop_by_hop(key) {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            builder = builder.header(key.as_str(), v);
        }
    }

    builder = builder.header("X-Cache", source.as_str());
    if let Some(version) = version {
        builder = builder.header("X-Cache-Version", version);
    }

    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build response");
            error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        })
}

fn error_response(status: StatusCode, message: &'static str) -> HttpResponse<Body> {
    let mut response = HttpResponse::new(Body::from(message));
    *response.status_mut() = status;
    response
}
