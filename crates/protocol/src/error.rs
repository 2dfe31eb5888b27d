//! Error taxonomy shared by the daemon and its clients.
//!
//! Every failure the HTTP surface can report collapses into one [`ErrorKind`].
//! The kind alone decides what the caller sees (a bare status line such as
//! `403 Forbidden`); the detail string travels with the error for server-side
//! logging and is never written to a response.

use std::fmt;

use thiserror::Error;

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing, malformed, expired or tampered token, bad credentials, or an
    /// identity that no longer resolves to a user.
    AuthFailure,
    /// The caller is authenticated but lacks the permission bit, or the path
    /// escapes their scope.
    PermissionDenied,
    /// The addressed resource does not exist.
    NotFound,
    /// The target already exists (username, rename destination, upload).
    Conflict,
    /// Malformed body or missing required field.
    Validation,
    /// Store or filesystem failure after authorization.
    Internal,
}

impl ErrorKind {
    /// Numeric HTTP status for this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::AuthFailure | ErrorKind::PermissionDenied => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::Internal => 500,
        }
    }

    /// Canonical reason phrase for the status code.
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorKind::AuthFailure | ErrorKind::PermissionDenied => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Validation => "Bad Request",
            ErrorKind::Internal => "Internal Server Error",
        }
    }

    /// The plain-text body sent to the caller, e.g. `"409 Conflict"`.
    pub fn status_line(&self) -> String {
        format!("{} {}", self.status_code(), self.reason())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AuthFailure => "authentication failed",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation failed",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// A typed request failure.
#[derive(Debug, Error)]
#[error("{kind}: {detail}")]
pub struct ApiError {
    kind: ErrorKind,
    detail: String,
}

impl ApiError {
    /// Create an error of the given kind with a server-side detail message.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn auth_failure(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailure, detail)
    }

    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Detail for logs. Never send this to a client.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Shorthand for `self.kind().status_line()`.
    pub fn status_line(&self) -> String {
        self.kind.status_line()
    }
}

/// Result type alias for request handling.
pub type Result<T> = std::result::Result<T, ApiError>;

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            ApiError::internal(err.to_string())
        } else {
            ApiError::validation(format!("invalid JSON: {}", err))
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        match err.kind() {
            IoKind::NotFound => ApiError::not_found(err.to_string()),
            IoKind::AlreadyExists => ApiError::conflict(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}
