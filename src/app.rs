//! In-process HTTP backends
//!
//! [`HttpAppLauncher`] serves each routing key from a hyper server running
//! inside the switchboard process, driven by a single handler function.
//! It backs the built-in demo mode and is handy for tests.

use crate::backend::{service_control, BackendLauncher, BackendService, ControlledService, ServiceMonitor};
use anyhow::Context;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Identity of the backend a request reached
#[derive(Debug, Clone)]
pub struct AppContext {
    pub key: String,
    pub port: u16,
}

type Handler = dyn Fn(&AppContext, Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync;

/// Launches an in-process hyper server per routing key
#[derive(Clone)]
pub struct HttpAppLauncher {
    handler: Arc<Handler>,
}

impl HttpAppLauncher {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&AppContext, Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Demo app answering every request with the backend's identity
    pub fn demo() -> Self {
        Self::new(|ctx, req| {
            let body = serde_json::json!({
                "app": ctx.key,
                "port": ctx.port,
                "path": req.uri().path(),
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body.to_string())))
                .expect("valid response with static header")
        })
    }
}

#[async_trait]
impl BackendLauncher for HttpAppLauncher {
    async fn start(&self, key: &str, port: u16) -> anyhow::Result<Arc<dyn BackendService>> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind 127.0.0.1:{}", port))?;
        info!(key, port, "In-process backend listening");

        let ctx = AppContext {
            key: key.to_string(),
            port,
        };
        let (control, monitor) = service_control();
        tokio::spawn(serve_app(listener, ctx, Arc::clone(&self.handler), monitor));

        Ok(Arc::new(ControlledService::new(port, control)))
    }
}

async fn serve_app(listener: TcpListener, ctx: AppContext, handler: Arc<Handler>, mut monitor: ServiceMonitor) {
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            biased;
            _ = monitor.shutdown_requested() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(key = %ctx.key, addr = %addr, "In-process backend accepted connection");
                        let ctx = ctx.clone();
                        let handler = Arc::clone(&handler);
                        let service = service_fn(move |req| {
                            let response = handler(&ctx, req);
                            async move { Ok::<_, Infallible>(response) }
                        });
                        let conn = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service);
                        let conn = graceful.watch(conn);
                        tokio::spawn(async move {
                            if let Err(e) = conn.await {
                                debug!(error = %e, "In-process backend connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(key = %ctx.key, error = %e, "Failed to accept backend connection");
                    }
                }
            }
        }
    }

    // Stop accepting before draining open connections
    drop(listener);
    graceful.shutdown().await;
    info!(key = %ctx.key, port = ctx.port, "In-process backend closed");
    monitor.exit("closed");
}
