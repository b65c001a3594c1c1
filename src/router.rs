use crate::config::ServerConfig;
use crate::error::{json_error_response, ForwardError, PoolError, ProxyErrorCode};
use crate::forward::{Forwarder, ForwarderConfig};
use crate::registry::BackendPool;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on the size of a backend's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// How requests are mapped to routing keys and how long they may take
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Key used when neither the Host nor the override header yields one
    pub default_key: String,
    /// Header consulted when the Host has no subdomain
    pub override_header: HeaderName,
    /// Max time to wait for a backend response
    pub request_timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_key: "default".to_string(),
            override_header: HeaderName::from_static("x-app-name"),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RoutingConfig {
    pub fn from_server(server: &ServerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            default_key: server.default_hostname.clone(),
            override_header: HeaderName::from_bytes(server.override_header.as_bytes())?,
            request_timeout: server.request_timeout(),
        })
    }
}

/// Per-request values threaded through the handlers
#[derive(Debug, Clone)]
struct RequestContext {
    key: String,
    request_id: String,
    client_addr: SocketAddr,
}

/// The front door: routes each request to the backend for its key
pub struct Switchboard {
    bind_addr: SocketAddr,
    pool: BackendPool,
    routing: Arc<RoutingConfig>,
    forwarder: Arc<Forwarder>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Switchboard {
    pub fn new(
        bind_addr: SocketAddr,
        pool: BackendPool,
        routing: RoutingConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_forwarder_config(bind_addr, pool, routing, shutdown_rx, ForwarderConfig::default())
    }

    pub fn with_forwarder_config(
        bind_addr: SocketAddr,
        pool: BackendPool,
        routing: RoutingConfig,
        shutdown_rx: watch::Receiver<bool>,
        forwarder_config: ForwarderConfig,
    ) -> Self {
        Self {
            bind_addr,
            pool,
            routing: Arc::new(routing),
            forwarder: Arc::new(Forwarder::new(forwarder_config)),
            shutdown_rx,
        }
    }

    /// Get the forwarder (for statistics)
    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Switchboard listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = self.pool.clone();
                            let routing = Arc::clone(&self.routing);
                            let forwarder = Arc::clone(&self.forwarder);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, pool, routing, forwarder).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Switchboard shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    pool: BackendPool,
    routing: Arc<RoutingConfig>,
    forwarder: Arc<Forwarder>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pool = pool.clone();
        let routing = Arc::clone(&routing);
        let forwarder = Arc::clone(&forwarder);
        async move { handle_request(req, pool, routing, forwarder, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    pool: BackendPool,
    routing: Arc<RoutingConfig>,
    forwarder: Arc<Forwarder>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = RequestContext {
        key: extract_routing_key(&req, &routing),
        request_id,
        client_addr,
    };

    set_proxy_headers(&mut req, &ctx);

    debug!(key = %ctx.key, method = %req.method(), uri = %req.uri(), request_id = %ctx.request_id, "Incoming request");

    let record = match pool.get_or_create(&ctx.key).await {
        Ok(record) => record,
        Err(e) => {
            // Log detailed error internally, return generic message externally
            warn!(key = %ctx.key, request_id = %ctx.request_id, error = %e, "No backend available");
            return Ok(json_error_response(e.code(), public_message(&e)));
        }
    };
    let port = record.port();

    if is_upgrade_request(&req) {
        return handle_upgrade(req, ctx, port, routing.request_timeout).await;
    }

    let request_timeout = routing.request_timeout;
    match tokio::time::timeout(request_timeout, forwarder.send_request(req, port)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(key = %ctx.key, port, request_id = %ctx.request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                key = %ctx.key,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

fn public_message(err: &PoolError) -> &'static str {
    match err {
        PoolError::CapacityExceeded { .. } | PoolError::PortsExhausted { .. } => {
            "Too many backends running, please retry later"
        }
        PoolError::ProvisioningFailed { .. } | PoolError::UnexpectedTermination { .. } => "Backend unavailable",
        PoolError::Closed => "Proxy is shutting down",
    }
}

/// Overwrite the forwarding headers; this proxy is the first trusted hop.
fn set_proxy_headers(req: &mut Request<Incoming>, ctx: &RequestContext) {
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Derive the routing key for a request.
///
/// 1. Host header (or URI authority) without its port; if it contains a dot,
///    the first label is the key.
/// 2. Otherwise the override header, verbatim.
/// 3. Otherwise the configured default.
pub fn extract_routing_key<B>(req: &Request<B>, routing: &RoutingConfig) -> String {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host());

    if let Some(label) = host.and_then(subdomain_label) {
        return label.to_string();
    }

    req.headers()
        .get(&routing.override_header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| routing.default_key.clone())
}

/// First dot-separated label of a host with a dot in it
fn subdomain_label(host: &str) -> Option<&str> {
    let hostname = strip_port(host);
    if !hostname.contains('.') {
        return None;
    }
    hostname.split('.').next().filter(|label| !label.is_empty())
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read a response head from the backend.
///
/// Returns the head (through the blank line) and any bytes read past it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Parse the status line and headers of a response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn upgrade_failed(ctx: &RequestContext, port: u16, error: impl std::fmt::Display) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ForwardError::Upgrade(error.to_string());
    error!(key = %ctx.key, port, request_id = %ctx.request_id, error = %error, "Upgrade passthrough failed");
    json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
}

/// Finish a response whose headers came from the backend
fn finish_upgrade_response(
    response: hyper::http::response::Builder,
    ctx: &RequestContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    response.body(empty_body()).unwrap_or_else(|e| {
        error!(key = %ctx.key, request_id = %ctx.request_id, error = %e, "Invalid upgrade response from backend");
        json_error_response(ProxyErrorCode::InternalError, "Invalid response from backend")
    })
}

/// Connect to the backend, send the upgrade request and read its response head
async fn open_upgrade<B>(req: &Request<B>, port: u16) -> std::io::Result<(TcpStream, Vec<u8>, Vec<u8>)> {
    let mut backend_stream = TcpStream::connect(("127.0.0.1", port)).await?;
    backend_stream.write_all(&build_upgrade_request(req, port)).await?;
    let (head, leftover) = read_response_head(&mut backend_stream).await?;
    Ok((backend_stream, head, leftover))
}

/// Pass a protocol upgrade through to the backend as raw bytes.
///
/// The handshake with the backend is bounded by `request_timeout`; the
/// upgraded stream itself is not.
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: RequestContext,
    port: u16,
    request_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(key = %ctx.key, request_id = %ctx.request_id, upgrade_type = %upgrade_type, "Handling upgrade request");

    let handshake = tokio::time::timeout(request_timeout, open_upgrade(&req, port)).await;
    let (backend_stream, head, leftover) = match handshake {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => return Ok(upgrade_failed(&ctx, port, e)),
        Err(_) => {
            warn!(
                key = %ctx.key,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Upgrade handshake timed out"
            );
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        return Ok(upgrade_failed(&ctx, port, "invalid upgrade response from backend"));
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        // Skip framing headers that hyper handles
        let name_lower = name.to_lowercase();
        if status == StatusCode::SWITCHING_PROTOCOLS
            && (name_lower == "content-length" || name_lower == "transfer-encoding")
        {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(key = %ctx.key, status = %status, "Backend rejected upgrade request");
        return Ok(finish_upgrade_response(response, &ctx));
    }

    info!(key = %ctx.key, request_id = %ctx.request_id, upgrade_type = %upgrade_type, "Upgrade successful");

    let response = finish_upgrade_response(response, &ctx);
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Ok(response);
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, leftover, &ctx).await;
            }
            Err(e) => {
                error!(key = %ctx.key, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Copy bytes both ways until either side closes
async fn forward_bidirectional(client: Upgraded, mut backend: TcpStream, leftover: Vec<u8>, ctx: &RequestContext) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(key = %ctx.key, error = %e, "Upgraded connection closed early");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                key = %ctx.key,
                request_id = %ctx.request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(key = %ctx.key, request_id = %ctx.request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: Option<&str>, app_name: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/");
        if let Some(host) = host {
            builder = builder.header(hyper::header::HOST, host);
        }
        if let Some(app_name) = app_name {
            builder = builder.header("x-app-name", app_name);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_key_from_subdomain() {
        let routing = RoutingConfig::default();
        assert_eq!(
            extract_routing_key(&request(Some("app-a.localhost:8000"), None), &routing),
            "app-a"
        );
        assert_eq!(
            extract_routing_key(&request(Some("api.example.com"), Some("ignored")), &routing),
            "api"
        );
    }

    #[test]
    fn test_key_from_override_header() {
        let routing = RoutingConfig::default();
        assert_eq!(
            extract_routing_key(&request(Some("localhost"), Some("custom")), &routing),
            "custom"
        );
        assert_eq!(
            extract_routing_key(&request(Some("localhost:8000"), Some("Custom")), &routing),
            "Custom"
        );
    }

    #[test]
    fn test_key_falls_back_to_default() {
        let routing = RoutingConfig::default();
        assert_eq!(extract_routing_key(&request(Some("localhost"), None), &routing), "default");
        assert_eq!(extract_routing_key(&request(None, None), &routing), "default");
        assert_eq!(extract_routing_key(&request(Some(".example"), None), &routing), "default");
        assert_eq!(extract_routing_key(&request(Some("localhost"), Some("")), &routing), "default");

        let routing = RoutingConfig {
            default_key: "Home".to_string(),
            override_header: HeaderName::from_static("x-tenant"),
            ..RoutingConfig::default()
        };
        assert_eq!(extract_routing_key(&request(Some("localhost"), Some("custom")), &routing), "Home");
    }

    #[test]
    fn test_key_from_uri_authority() {
        let routing = RoutingConfig::default();
        let req = Request::builder()
            .uri("http://blog.example.com:8443/posts")
            .body(())
            .unwrap();
        assert_eq!(extract_routing_key(&req, &routing), "blog");
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("app.localhost:8000"), "app.localhost");
        assert_eq!(strip_port("localhost"), "localhost");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().header("Upgrade", "websocket").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let req = Request::builder()
            .uri("/ws?room=1")
            .header("Host", "chat.example.com")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        let raw = String::from_utf8(build_upgrade_request(&req, 9003)).unwrap();

        assert!(raw.starts_with("GET /ws?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(raw.contains("Host: 127.0.0.1:9003\r\n"));
        assert!(!raw.contains("chat.example.com"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_public_messages_hide_details() {
        let err = PoolError::ProvisioningFailed {
            key: "app".to_string(),
            reason: "/srv/secret/path: permission denied".to_string(),
        };
        assert_eq!(public_message(&err), "Backend unavailable");
    }
}
