//! Error types for the relay

use axum::http::StatusCode;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Unknown tenant or incomplete credentials
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection or timeout failure before the first event was produced
    #[error("Transient upstream error: {0}")]
    TransientUpstream(String),

    /// The provider rejected the request (bad token, bad bot id, ...)
    #[error("Upstream rejected request ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// A single upstream item could not be interpreted
    #[error("Malformed upstream event: {0}")]
    MalformedEvent(String),

    /// Failure after at least one event was yielded
    #[error("Upstream stream failed: {0}")]
    MidStreamUpstream(String),

    /// An internal event could not be encoded for the wire
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The inbound request failed validation
    #[error("Invalid request: {0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl RelayError {
    /// Whether the retry controller may attempt the operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::TransientUpstream(_))
    }

    /// HTTP status used when the error is reported as a single JSON response
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::TransientUpstream(_)
            | RelayError::Upstream { .. }
            | RelayError::MalformedEvent(_)
            | RelayError::MidStreamUpstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::Config(_)
            | RelayError::Serialization(_)
            | RelayError::Io(_)
            | RelayError::General(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short category name for structured logs
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::TransientUpstream(_) => "transient_upstream",
            RelayError::Upstream { .. } => "upstream",
            RelayError::MalformedEvent(_) => "malformed_event",
            RelayError::MidStreamUpstream(_) => "mid_stream_upstream",
            RelayError::Serialization(_) => "serialization",
            RelayError::Validation(_) => "validation",
            RelayError::Io(_) => "io",
            RelayError::General(_) => "general",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
