//! Pooled HTTP forwarding to the gateway port
//!
//! Connections to the gateway are reused through the hyper-util legacy
//! client. Responses come back untouched apart from two debug headers.

use crate::error::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Marks responses that came from the gateway through the proxy
pub const X_PROXY_DEBUG: &str = "x-proxy-debug";
/// Original request path, echoed on forwarded responses
pub const X_DEBUG_PATH: &str = "x-debug-path";
const PROXY_DEBUG_VALUE: &str = "proxy-to-gateway";

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

#[derive(Debug, Default)]
pub struct ForwardStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Maximum idle connections kept to the gateway
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// The container's `forward(request, port)` primitive over loopback HTTP
pub struct ForwardClient {
    client: Client<HttpConnector, Incoming>,
    host: String,
    stats: Arc<ForwardStats>,
}

impl ForwardClient {
    pub fn new(host: impl Into<String>, config: ForwardConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Gateway client initialized"
        );

        Self {
            client,
            host: host.into(),
            stats: Arc::new(ForwardStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to the gateway on `port`, keeping method, headers and body
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let path = req.uri().path().to_string();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}:{}{}", self.host, port, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let gateway_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.stats.record_request();
        let response = match self.client.request(gateway_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (mut parts, body) = response.into_parts();
        parts
            .headers
            .insert(X_PROXY_DEBUG, HeaderValue::from_static(PROXY_DEBUG_VALUE));
        if let Ok(value) = HeaderValue::from_str(&path) {
            parts.headers.insert(X_DEBUG_PATH, value);
        }
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_config_default() {
        let config = ForwardConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_forward_stats() {
        let stats = ForwardStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = ForwardClient::new("127.0.0.1", ForwardConfig::default());
        assert_eq!(client.stats().get_total_requests(), 0);
    }
}
