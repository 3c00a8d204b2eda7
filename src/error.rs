//! Request-level error taxonomy.
//!
//! Every failure a request can surface is one of these kinds; handlers and
//! the synchronizer signal by kind, and the `IntoResponse` impl owns the
//! mapping to HTTP status codes. Kinds are `Clone` so a singleflight result
//! can be fanned out to every coalesced waiter.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream rejected credentials for {0}")]
    Unauthorized(String),
    #[error("repository not found: {0}")]
    NotFound(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream operation exceeded {0}s deadline")]
    UpstreamTimeout(u64),
    #[error("mirror storage full while handling {0}")]
    StorageFull(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable kind name used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "invalid-request",
            ProxyError::Unauthorized(_) => "unauthorized",
            ProxyError::NotFound(_) => "not-found",
            ProxyError::UpstreamUnavailable(_) => "upstream-unavailable",
            ProxyError::UpstreamTimeout(_) => "upstream-timeout",
            ProxyError::StorageFull(_) => "storage-full",
            ProxyError::Internal(_) => "internal",
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ProxyError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Internal(format!("{err:#}"))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if let ProxyError::Internal(msg) = &self {
            error!(error = %msg, "internal server error");
        }
        let status = self.status();
        match self {
            ProxyError::Unauthorized(_) => (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"mirrorcache\"")],
                format!("{self}\n"),
            )
                .into_response(),
            _ => (status, format!("{self}\n")).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_status_codes() {
        let cases = [
            (ProxyError::InvalidRequest("x".into()), 400),
            (ProxyError::Unauthorized("x".into()), 401),
            (ProxyError::NotFound("x".into()), 404),
            (ProxyError::UpstreamUnavailable("x".into()), 502),
            (ProxyError::UpstreamTimeout(30), 504),
            (ProxyError::StorageFull("x".into()), 507),
            (ProxyError::Internal("x".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(err.status().as_u16(), code, "{err}");
        }
    }
}
