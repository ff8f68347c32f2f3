//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the control plane
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Control-plane error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A sibling service answered with a non-2xx status.
    #[error("{service} returned {status}: {body}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// A sibling service could not be reached at all.
    #[error("{service} unreachable: {source}")]
    Unreachable {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("container command failed: {0}")]
    Container(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Status + parsed body from an upstream reply, preserved for callers.
    pub fn upstream(service: &'static str, status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            status,
            body: body.into(),
        }
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { .. } | Self::Unreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body returned to API callers
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message
    pub error: String,

    /// Stable machine-readable code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status (duplicated in the body for log scraping)
    pub status: u16,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let code = match &self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Upstream { .. } => "UPSTREAM_ERROR",
            Error::Unreachable { .. } => "UPSTREAM_UNREACHABLE",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::NotFound(_) => "NOT_FOUND",
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::Container(_) => "CONTAINER_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        };

        // Internal failure detail stays in the logs, not the response body.
        let message = if status.is_server_error() {
            tracing::error!(code, "request failed: {}", self);
            match &self {
                Error::Upstream { service, .. } | Error::Unreachable { service, .. } => {
                    format!("{service} unavailable")
                }
                _ => "internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error: message,
            code: Some(code.to_string()),
            status: status.as_u16(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::Unauthorized("no token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::Forbidden("tenant mismatch".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::upstream("auth-service", 500, "boom").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::Timeout("editor health".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn upstream_preserves_status_and_body() {
        let err = Error::upstream("compute-manager", 409, "{\"error\":\"busy\"}");
        match err {
            Error::Upstream { service, status, body } => {
                assert_eq!(service, "compute-manager");
                assert_eq!(status, 409);
                assert!(body.contains("busy"));
            }
            _ => panic!("wrong variant"),
        }
    }
}
