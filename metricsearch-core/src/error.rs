//! Error types for the metricsearch engine

use serde_json::Value;
use thiserror::Error;

/// Result type for metricsearch operations
pub type SearchResult<T> = Result<T, SearchError>;

/// Error types for query compilation and response transformation
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Formula error: {0}")]
    Formula(String),

    #[error("Time range error: {0}")]
    TimeRange(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Error reported by the search backend inside a batched response.
    #[error("{message}")]
    Upstream {
        message: String,
        /// Raw diagnostic payload (pretty-printed backend error object).
        data: String,
        /// Originating request context, if the transport attached one.
        config: Option<Value>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SearchError {
    /// Create a new compile error
    pub fn compile<S: Into<String>>(message: S) -> Self {
        Self::Compile(message.into())
    }

    /// Create a new transform error
    pub fn transform<S: Into<String>>(message: S) -> Self {
        Self::Transform(message.into())
    }

    /// Create a new formula error
    pub fn formula<S: Into<String>>(message: S) -> Self {
        Self::Formula(message.into())
    }

    /// Create a new time range error
    pub fn time_range<S: Into<String>>(message: S) -> Self {
        Self::TimeRange(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Build an upstream error from a backend error object.
    ///
    /// The message prefers the nested root-cause reason, then the top-level
    /// reason, then a generic fallback.
    pub fn upstream(error: &Value, config: Option<Value>) -> Self {
        let message = error
            .get("root_cause")
            .and_then(Value::as_array)
            .and_then(|causes| causes.first())
            .and_then(|cause| cause.get("reason"))
            .and_then(Value::as_str)
            .or_else(|| error.get("reason").and_then(Value::as_str))
            .unwrap_or("Unknown search error response")
            .to_string();

        Self::Upstream {
            message,
            data: serde_json::to_string_pretty(error).unwrap_or_default(),
            config,
        }
    }

    /// Get the error category for monitoring/metrics
    pub fn category(&self) -> &'static str {
        match self {
            SearchError::Compile(_) => "compile",
            SearchError::Transform(_) => "transform",
            SearchError::Formula(_) => "formula",
            SearchError::TimeRange(_) => "time_range",
            SearchError::Transport(_) => "transport",
            SearchError::Upstream { .. } => "upstream",
            SearchError::Json(_) => "json",
        }
    }
}
