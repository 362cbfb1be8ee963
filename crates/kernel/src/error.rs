//! Engine error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use thiserror::Error;

/// Backend error type raised when a target index does not exist yet.
pub const INDEX_NOT_FOUND: &str = "index_not_found_exception";

/// Errors raised by the engine and its backend drivers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Backend unreachable or misconfigured at startup.
    #[error("search engine configuration error: {0}")]
    Configuration(String),

    /// Generic backend-call failure. Always carries the offending request.
    #[error("search engine request failed: {message}")]
    Database {
        message: String,
        /// Backend error type when the backend reported one.
        kind: Option<String>,
        request: Box<Value>,
        #[source]
        source: anyhow::Error,
    },

    /// More shards failed than the configured tolerance.
    #[error("search returned {failed} failed shards (tolerated: {threshold})")]
    EngineShards {
        failed: u64,
        threshold: u64,
        reasons: Vec<String>,
    },

    /// Malformed filter shape, disallowed field or missing backend capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Caller-level misuse.
    #[error("functional error: {0}")]
    Functional(String),
}

impl EngineError {
    /// Build a database error around the request that triggered it.
    pub fn database(
        message: impl Into<String>,
        request: Value,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        EngineError::Database {
            message: message.into(),
            kind: None,
            request: Box::new(request),
            source: source.into(),
        }
    }

    /// Attach the backend error type to a database error.
    pub fn with_kind(self, kind: Option<String>) -> Self {
        match self {
            EngineError::Database {
                message,
                request,
                source,
                ..
            } => EngineError::Database {
                message,
                kind,
                request,
                source,
            },
            other => other,
        }
    }

    /// Whether this failure only means the target index has not been created yet.
    pub fn is_missing_index(&self) -> bool {
        matches!(
            self,
            EngineError::Database { kind: Some(kind), .. } if kind == INDEX_NOT_FOUND
        )
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Unsupported(_) | EngineError::Functional(_) => StatusCode::BAD_REQUEST,
            EngineError::Configuration(_)
            | EngineError::Database { .. }
            | EngineError::EngineShards { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Backend details stay in the logs, callers only get the category
        let body = match &self {
            EngineError::Database {
                message,
                request,
                source,
                ..
            } => {
                tracing::error!(error = %source, request = %request, "{message}");
                "search engine error".to_string()
            }
            EngineError::EngineShards { reasons, .. } => {
                tracing::error!(error = %self, reasons = ?reasons, "shard failures");
                "search engine error".to_string()
            }
            EngineError::Configuration(_) => {
                tracing::error!(error = %self, "configuration error");
                "search engine error".to_string()
            }
            _ => self.to_string(),
        };

        (status, body).into_response()
    }
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
