//! Request forwarding to backends
//!
//! [`Forwarder`] wraps a pooled hyper client and rewrites each request to
//! target `127.0.0.1:<port>`. Failures come back as [`ForwardError`] for the
//! router to translate; forwarding never touches backend lifecycle state.

use crate::error::ForwardError;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Counters for forwarded traffic
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

/// Connection pooling settings for the forwarding client
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum idle connections per backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Forwards requests to local backends over pooled connections
pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<ForwardStats>,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
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
            "Forwarding client initialized"
        );

        Self {
            client,
            stats: Arc::new(ForwardStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to the backend listening on `port`
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        self.stats.record_request();
        let result = self.forward(req, port).await;
        if result.is_err() {
            self.stats.record_failure();
        }
        result
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let (parts, body) = req.into_parts();
        let uri = backend_uri(port, parts.uri.path_and_query().map(|pq| pq.as_str()));

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Absolute URI of `path_and_query` on the local backend at `port`
pub fn backend_uri(port: u16, path_and_query: Option<&str>) -> String {
    format!("http://127.0.0.1:{}{}", port, path_and_query.unwrap_or("/"))
}
