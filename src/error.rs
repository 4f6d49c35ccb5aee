//! Error types for the gateway sidecar

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type for sidecar operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sidecar operations
#[derive(Debug, Error)]
pub enum Error {
    /// Request validation failed (bad view name or missing cluster)
    #[error("{0}")]
    Validation(String),

    /// View already exists
    #[error("view already exists")]
    Conflict,

    /// View is not known to the store
    #[error("view not found: {0}")]
    NotFound(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Assembled snapshot failed its consistency check
    #[error("snapshot inconsistent: {0}")]
    Snapshot(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a snapshot consistency error
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the underlying Kubernetes error is an AlreadyExists conflict
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.reason == "AlreadyExists")
    }

    /// True when the underlying Kubernetes error is a NotFound
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Conflict => (StatusCode::CONFLICT, self.to_string()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Kube(_) => (StatusCode::INTERNAL_SERVER_ERROR, "failed to create service".to_string()),
            Error::Snapshot(_) | Error::Config(_) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}
