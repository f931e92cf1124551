//! # Error Module
//!
//! Client-facing error taxonomy shared by the route table, the dispatcher,
//! the collection bridge and the transport.
//!
//! Every variant carries a machine-readable `kind` and a human-readable
//! message. [`ApiError::to_body`] renders the structured JSON body sent to
//! clients:
//!
//! ```json
//! { "error": { "kind": "MethodNotAllowed", "message": "...", "allowed": ["GET", "PATCH"] } }
//! ```
//!
//! Errors that happen after a chunked response has started are *not*
//! `ApiError`s; see [`crate::streaming::StreamError`].

use crate::router::RouteError;
use http::{Method, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

/// Errors recoverable at the dispatcher boundary.
///
/// Each one becomes exactly one response, as long as no bytes were committed
/// to the connection yet.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No registered pattern matched the request path.
    #[error("no route matches '{path}'")]
    NotFound { path: String },

    /// At least one pattern matched the path, none for this method.
    #[error("method {method} not allowed for '{path}'")]
    MethodNotAllowed {
        method: Method,
        path: String,
        allowed: Vec<Method>,
    },

    /// Malformed input, oversized body or a bad route template.
    #[error("{0}")]
    BadRequest(String),

    /// The authorization collaborator refused the request.
    #[error("{0}")]
    Forbidden(String),

    /// Worker pool saturated or a collaborator is down.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// A bounded collection was asked for identifiers the feed does not know.
    #[error("invalid identifiers: {}", unknown.join(", "))]
    CollectionRejected { unknown: Vec<String> },

    /// Unexpected failure before anything was sent. The detail is logged,
    /// clients only see a generic message.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Wrap any displayable failure as an internal error.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::BadRequest(_) | ApiError::CollectionRejected { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::NotFound { .. } => "NotFound",
            ApiError::MethodNotAllowed { .. } => "MethodNotAllowed",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::ServiceUnavailable(_) => "ServiceUnavailable",
            ApiError::CollectionRejected { .. } => "CollectionRejected",
            ApiError::Internal(_) => "InternalError",
        }
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }

    /// Methods to advertise in an `Allow` header, if any.
    #[must_use]
    pub fn allowed_methods(&self) -> Option<&[Method]> {
        match self {
            ApiError::MethodNotAllowed { allowed, .. } => Some(allowed),
            _ => None,
        }
    }

    /// Structured JSON body for the client.
    #[must_use]
    pub fn to_body(&self) -> Value {
        let message = match self {
            ApiError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        let mut error = json!({
            "kind": self.kind(),
            "message": message,
        });
        match self {
            ApiError::MethodNotAllowed { allowed, .. } => {
                error["allowed"] = allowed.iter().map(Method::as_str).collect::<Vec<_>>().into();
            }
            ApiError::CollectionRejected { unknown } => {
                error["unknown"] = unknown.clone().into();
            }
            _ => {}
        }
        json!({ "error": error })
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}
