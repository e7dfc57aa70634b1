//! Per-subsystem error taxonomy, composed into [`ProxyError`] for the two
//! HTTP-surfaced cases. Everything else is logged in place and never reaches
//! a client response body.

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
    #[error("environment config failed validation: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("failed to spawn chrome subprocess: {0}")]
    Spawn(String),
    #[error("failed to probe debugger endpoint: {0}")]
    VersionProbe(String),
    #[error("debugger response did not contain a parseable browser id")]
    MissingBrowserId,
    #[error("debugger target list was empty")]
    NoTargets,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is at capacity")]
    AtCapacity,
    #[error("no debug port available")]
    NoPortAvailable,
    #[error("no browser available for use")]
    NoneAvailable,
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("the admission queue has been stopped")]
    Stopped,
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("rate limiter deadline exceeded")]
    RateLimitTimeout,
    #[error("read error: {0}")]
    Read(String),
    #[error("write error: {0}")]
    Write(String),
    #[error("failed to dial browser debugger endpoint: {0}")]
    Dial(String),
    #[error("failed to accept client websocket upgrade: {0}")]
    Accept(String),
    #[error("peer closed with abnormal status code {0}")]
    AbnormalClose(u16),
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("zip archive entry escapes destination directory: {0}")]
    ZipSlip(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

/// The two outward-facing error cases from the HTTP surface; everything else
/// in the system is handled internally and logged, never returned as
/// `ProxyError`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unable to create options for chrome startup: {0}")]
    InvalidOptions(String),
    #[error("access token does not match required token")]
    Unauthorized,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            ProxyError::InvalidOptions(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
        };
        let body = json!({
            "id": -1,
            "error": {
                "code": -1,
                "message": self.to_string(),
            }
        });
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
