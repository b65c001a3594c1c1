use crate::forward::ForwardStats;
use crate::registry::{BackendPool, BackendRecord};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Read-only view of the running backends and forwarding counters.
/// Binds to loopback only.
pub struct AdminServer {
    bind_addr: SocketAddr,
    pool: BackendPool,
    stats: Arc<ForwardStats>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        pool: BackendPool,
        stats: Arc<ForwardStats>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            pool,
            stats,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = self.pool.clone();
                            let stats = Arc::clone(&self.stats);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, pool, stats).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, pool: BackendPool, stats: Arc<ForwardStats>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let pool = pool.clone();
        let stats = Arc::clone(&stats);
        async move { handle_admin_request(req, pool, stats).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

async fn handle_admin_request<B>(
    req: Request<B>,
    pool: BackendPool,
    stats: Arc<ForwardStats>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/backends") => json_response(StatusCode::OK, backends_body(&pool).to_string()),

        (&Method::GET, "/stats") => {
            let body = serde_json::json!({
                "forwarded_requests": stats.get_total_requests(),
                "failed_requests": stats.get_failed_requests(),
                "backends": pool.len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn backends_body(pool: &BackendPool) -> serde_json::Value {
    let mut backends = pool.list();
    backends.sort_by_key(BackendRecord::port);

    let backend_list: Vec<serde_json::Value> = backends
        .iter()
        .map(|b| {
            serde_json::json!({
                "key": b.key(),
                "port": b.port(),
                "created_at": b.created_at().to_rfc3339(),
                "uptime_secs": b.uptime().as_secs(),
            })
        })
        .collect();

    serde_json::json!({
        "backends": backend_list,
        "count": backend_list.len(),
        "max_servers": pool.config().max_servers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::HttpAppLauncher;
    use crate::registry::PoolConfig;
    use http_body_util::BodyExt;

    fn get(path: &str) -> Request<()> {
        Request::builder().method(Method::GET).uri(path).body(()).unwrap()
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn empty_pool() -> BackendPool {
        BackendPool::new(PoolConfig::new(42000).with_max_servers(7), Arc::new(HttpAppLauncher::demo()))
    }

    fn no_stats() -> Arc<ForwardStats> {
        Arc::new(ForwardStats::default())
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let pool = empty_pool();

        let resp = handle_admin_request(get("/health"), pool.clone(), no_stats()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "ok");

        let resp = handle_admin_request(get("/version"), pool, no_stats()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["name"], PKG_NAME);
        assert_eq!(json["version"], VERSION);
    }

    #[tokio::test]
    async fn test_backends_empty_pool() {
        let resp = handle_admin_request(get("/backends"), empty_pool(), no_stats()).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["count"], 0);
        assert_eq!(json["max_servers"], 7);
        assert!(json["backends"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let resp = handle_admin_request(get("/ready/app"), empty_pool(), no_stats()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder().method(Method::POST).uri("/backends").body(()).unwrap();
        let resp = handle_admin_request(req, empty_pool(), no_stats()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_reports_forward_counters() {
        let stats = no_stats();
        stats.record_request();
        stats.record_request();
        stats.record_failure();

        let resp = handle_admin_request(get("/stats"), empty_pool(), stats).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["forwarded_requests"], 2);
        assert_eq!(json["failed_requests"], 1);
        assert_eq!(json["backends"], 0);
    }
}
