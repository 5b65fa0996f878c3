//! Error types for the request-lifecycle engine.
//!
//! `ProxyError` covers the client-visible error table: each variant maps to
//! exactly one HTTP status and body shape. `ConfigError` and
//! `CoordinationError` cover the two ambient layers (config loading, the
//! Leader/Follower channel) that never terminate an HTTP response directly.

use actix_web::{http::StatusCode, HttpResponse};
use serde_json::json;

/// Client-visible outcome of a request that did not reach the upstream
/// response it was hoping for. Every variant corresponds to a row in the
/// error-kind table: origin, HTTP status, and body shape are all fixed by
/// the variant.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A `block` rule matched; `status` and `body` come from the rule.
    #[error("blocked by rule")]
    ClassifyBlocked { status: u16, body: serde_json::Value },

    /// Admission rejected the task because the queue is already at
    /// `maxQueueSize`. No upstream call was made.
    #[error("queue full")]
    QueueFull,

    /// The task's wait timer fired before a worker slot freed up.
    #[error("queue wait timeout")]
    QueueTimeout,

    /// An administrative `clearQueue()` cancelled this waiter.
    #[error("queue cleared")]
    QueueCleared,

    /// The socket could not be established, or was reset/DNS-failed before
    /// any byte of the response arrived.
    #[error("upstream connection error: {0}")]
    UpstreamConnectionError(String),

    /// Upstream answered with a 4xx/5xx. Passed through verbatim — this
    /// variant exists so the orchestrator can distinguish it from
    /// `UpstreamConnectionError`, but callers should prefer forwarding the
    /// original response directly rather than constructing this variant's
    /// `error_response`.
    #[error("upstream http error {status}")]
    UpstreamHTTPError { status: u16, body: Vec<u8> },

    /// Malformed status line, headers, or chunk framing from upstream.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    /// Client went away; there is no response to write.
    #[error("client disconnected")]
    ClientDisconnected,

    /// The process is shutting down and can no longer accept new work.
    #[error("server shutting down")]
    ServerShuttingDown,

    /// Anything that reached the orchestrator uncaught.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// The HTTP status this error should produce, independent of whether it
    /// is actually written (see `ClientDisconnected`, which writes nothing).
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::ClassifyBlocked { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::OK)
            }
            ProxyError::QueueFull | ProxyError::QueueTimeout | ProxyError::QueueCleared => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UpstreamConnectionError(_) | ProxyError::UpstreamProtocolError(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::UpstreamHTTPError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::ClientDisconnected => StatusCode::OK, // never actually written
            ProxyError::ServerShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl actix_web::error::ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        ProxyError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            ProxyError::ClassifyBlocked { status, body } => HttpResponse::build(
                StatusCode::from_u16(*status).unwrap_or(StatusCode::OK),
            )
            .json(body),
            ProxyError::QueueFull => HttpResponse::build(self.status_code()).json(json!({
                "error": "queue is full",
                "code": "QUEUE_FULL_OR_TIMEOUT",
            })),
            ProxyError::QueueTimeout => HttpResponse::build(self.status_code()).json(json!({
                "error": "queue wait timeout exceeded",
            })),
            ProxyError::QueueCleared => HttpResponse::build(self.status_code()).json(json!({
                "error": "queue was cleared",
            })),
            ProxyError::UpstreamConnectionError(msg) => {
                HttpResponse::build(self.status_code()).json(json!({ "error": msg }))
            }
            ProxyError::UpstreamHTTPError { body, .. } => HttpResponse::build(self.status_code())
                .content_type("application/octet-stream")
                .body(body.clone()),
            ProxyError::UpstreamProtocolError(msg) => {
                HttpResponse::build(self.status_code()).json(json!({ "error": msg }))
            }
            ProxyError::ClientDisconnected => HttpResponse::build(self.status_code()).finish(),
            ProxyError::ServerShuttingDown => HttpResponse::build(self.status_code()).json(json!({
                "error": "server is shutting down",
            })),
            ProxyError::Internal(_) => HttpResponse::build(self.status_code()).json(json!({
                "error": "internal",
            })),
        }
    }
}

/// Errors raised while loading or reloading the on-disk `Config` snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("config path escapes the working directory: {0}")]
    PathTraversal(String),

    #[error("config file too large: {0} bytes (max {1})")]
    TooLarge(u64, u64),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config validation failed: {0}")]
    Invalid(String),
}

/// Errors raised by the Leader/Follower coordination channel. These never
/// reach an HTTP client directly; they are logged and drive reconnect
/// decisions.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("switch_result timed out")]
    SwitchResultTimeout,

    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}
