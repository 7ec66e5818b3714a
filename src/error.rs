//! Error handling for camstate

use crate::permission::PermissionSet;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key was never registered
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// Requester's permissions do not intersect the cell's required set
    #[error("Permission denied for {key}: requires one of [{required}]")]
    PermissionDenied { key: String, required: PermissionSet },

    /// Validator rejected the value
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// Key registered twice (startup only, fatal)
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Durable write failed (retried internally, never surfaced to writers)
    #[error("Persistence failure for {key}: {message}")]
    PersistenceFailure { key: String, message: String },

    /// Outbound queue overflow for one connection
    #[error("Connection {0} overflowed its outbound queue")]
    ConnectionOverflow(Uuid),

    /// Role name not defined
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// Connection state machine violation
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Unauthorized
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed client message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Key the error refers to, if any
    pub fn key(&self) -> Option<&str> {
        match self {
            Error::UnknownKey(key)
            | Error::DuplicateKey(key)
            | Error::PermissionDenied { key, .. }
            | Error::InvalidValue { key, .. }
            | Error::PersistenceFailure { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Short reason string used on the wire (`{"error": reason, "key": key}`)
    pub fn reason(&self) -> String {
        match self {
            Error::UnknownKey(_) => "unknown key".to_string(),
            Error::PermissionDenied { required, .. } => {
                format!("permission denied (requires one of: {})", required)
            }
            Error::InvalidValue { reason, .. } => format!("invalid value: {}", reason),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            Error::UnknownKey(_) | Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::PermissionDenied { .. } => (StatusCode::FORBIDDEN, "PERMISSION_DENIED"),
            Error::InvalidValue { .. } => (StatusCode::BAD_REQUEST, "INVALID_VALUE"),
            Error::Protocol(_) => (StatusCode::BAD_REQUEST, "PROTOCOL_ERROR"),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Error::UnknownRole(_) => (StatusCode::FORBIDDEN, "UNKNOWN_ROLE"),
            Error::Conflict(_) | Error::DuplicateKey(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Error::ConnectionOverflow(_) => (StatusCode::SERVICE_UNAVAILABLE, "OVERFLOW"),
            Error::InvalidTransition(_) => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            Error::PersistenceFailure { .. } | Error::Sqlx(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
            }
            Error::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = %status, error_code = %error_code, message = %message, "Request error");
        } else {
            tracing::debug!(status = %status, error_code = %error_code, message = %message, "Request rejected");
        }

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
