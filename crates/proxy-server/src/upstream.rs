use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, Request as HttpRequest};
use fieldcache::{Network, NetworkError, Request, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

pub type HttpClient = Client<HttpConnector, Body>;

/// Hop-by-hop headers are never forwarded or stored. `Host` is rebuilt from
/// the upstream URI.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
            | "host"
    )
}

/// The single origin the proxy serves, reached over HTTP.
pub struct UpstreamNetwork {
    client: HttpClient,
    base_url: String,
    timeout: Duration,
}

impl UpstreamNetwork {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn build_request(&self, request: &Request) -> Result<HttpRequest<Body>, NetworkError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;
        let path = if request.url.starts_with('/') {
            request.url.clone()
        } else {
            format!("/{}", request.url)
        };

        let mut builder = HttpRequest::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path));
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::debug!(header = %name, "dropping unrepresentable request header");
                continue;
            };
            builder = builder.header(name, value);
        }

        builder
            .body(Body::from(request.body.clone()))
            .map_err(|e| NetworkError::InvalidRequest(e.to_string()))
    }

    async fn send(&self, request: &Request) -> Result<Response, NetworkError> {
        let upstream_req = self.build_request(request)?;
        let upstream_resp = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| NetworkError::Unreachable(e.to_string()))?;

        let status = upstream_resp.status().as_u16();
        let headers = upstream_resp
            .headers()
            .iter()
            .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();

        let body = upstream_resp
            .into_body()
            .collect()
            .await
            .map_err(|e| NetworkError::Body(e.to_string()))?
            .to_bytes();

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

impl Network for UpstreamNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::warn!(url = %request.url, error = %e, "upstream request failed");
                }
                result
            }
            Err(_) => {
                tracing::warn!(url = %request.url, timeout_ms = self.timeout.as_millis(), "upstream request timed out");
                Err(NetworkError::Timeout(self.timeout))
            }
        }
    }
}
