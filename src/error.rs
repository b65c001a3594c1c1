//! Error types and JSON error responses for the switchboard

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failures of the backend pool.
///
/// `Clone` because one provisioning outcome is shared by every caller that
/// was deduplicated onto it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("backend pool is at capacity ({max_servers} backends), cannot start '{key}'")]
    CapacityExceeded { key: String, max_servers: usize },

    #[error("backend '{key}' failed to start: {reason}")]
    ProvisioningFailed { key: String, reason: String },

    #[error("backend '{key}' terminated unexpectedly: {reason}")]
    UnexpectedTermination { key: String, reason: String },

    #[error("no ports left to assign to backend '{key}'")]
    PortsExhausted { key: String },

    #[error("backend pool is shutting down")]
    Closed,
}

impl PoolError {
    /// Error code reported to HTTP clients for this failure
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            PoolError::CapacityExceeded { .. } => ProxyErrorCode::CapacityExceeded,
            PoolError::ProvisioningFailed { .. } => ProxyErrorCode::BackendStartFailed,
            PoolError::UnexpectedTermination { .. } => ProxyErrorCode::BackendStartFailed,
            PoolError::PortsExhausted { .. } => ProxyErrorCode::CapacityExceeded,
            PoolError::Closed => ProxyErrorCode::ShuttingDown,
        }
    }
}

/// Failures forwarding a request to an already resolved backend
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),

    #[error("upgrade error: {0}")]
    Upgrade(String),
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// The pool cannot admit another backend
    CapacityExceeded,
    /// Backend failed to start
    BackendStartFailed,
    /// The proxy is shutting down
    ShuttingDown,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendStartFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
