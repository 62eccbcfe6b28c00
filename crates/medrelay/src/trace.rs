//! Per-request correlation ids
//!
//! A trace id is created when a request enters the server, scoped to the
//! task serving it, attached to every log line through a `request` span,
//! echoed in the `x-request-id` response header and written into every
//! relayed frame.

use std::future::Future;

use thiserror::Error;
use tracing::Span;
use uuid::Uuid;

/// Response header carrying the trace id; a caller-sent value is only logged
pub const TRACE_HEADER: &str = "x-request-id";

/// Value reported by [`current`] outside of a request scope
pub const NO_TRACE: &str = "-";

/// Maximum length accepted for caller-supplied ids
const MAX_TRACE_ID_LEN: usize = 128;

tokio::task_local! {
    static TRACE_ID: TraceId;
}

/// Errors for caller-supplied trace ids
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraceIdError {
    #[error("Trace ID cannot be empty")]
    Empty,

    #[error("Trace ID contains invalid characters: allowed are a-z, A-Z, 0-9, _, -")]
    InvalidChars,

    #[error("Trace ID exceeds maximum length of {MAX_TRACE_ID_LEN} characters")]
    TooLong,
}

/// A request correlation id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    /// Generate a fresh, time-ordered id (UUID v7)
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `request` span every log line of this request is recorded under
    ///
    /// `client_request_id` starts empty and is filled in when the caller
    /// sent an id of its own.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "request",
            request_id = %self.0,
            client_request_id = tracing::field::Empty
        )
    }

    fn validate(s: &str) -> Result<(), TraceIdError> {
        if s.is_empty() {
            return Err(TraceIdError::Empty);
        }

        if s.len() > MAX_TRACE_ID_LEN {
            return Err(TraceIdError::TooLong);
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(TraceIdError::InvalidChars);
        }

        Ok(())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&str> for TraceId {
    type Error = TraceIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::validate(value)?;
        Ok(TraceId(value.to_string()))
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run `fut` with `id` as the active trace id
pub fn scope<F: Future>(id: TraceId, fut: F) -> impl Future<Output = F::Output> {
    TRACE_ID.scope(id, fut)
}

/// The trace id of the calling request, or [`NO_TRACE`] outside one
pub fn current() -> String {
    TRACE_ID
        .try_with(|id| id.0.clone())
        .unwrap_or_else(|_| NO_TRACE.to_string())
}

/// The active [`TraceId`], if the caller runs inside a request scope
pub fn current_id() -> Option<TraceId> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique() {
        let a = TraceId::new();
        let b = TraceId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_ids_are_time_ordered() {
        let ids: Vec<TraceId> = (0..50).map(|_| TraceId::new()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0].as_str() < pair[1].as_str());
        }
    }

    #[test]
    fn test_current_outside_scope_is_sentinel() {
        assert_eq!(current(), NO_TRACE);
    }

    #[tokio::test]
    async fn test_current_inside_scope() {
        let id = TraceId::new();
        let expected = id.to_string();
        let (seen, seen_id) = scope(id, async { (current(), current_id()) }).await;
        assert_eq!(seen, expected);
        assert_eq!(seen_id.unwrap().as_str(), expected);
        assert_eq!(current(), NO_TRACE);
        assert!(current_id().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_scopes_do_not_leak() {
        let a = TraceId::try_from("req-a").unwrap();
        let b = TraceId::try_from("req-b").unwrap();

        let task_a = tokio::spawn(scope(a, async {
            tokio::task::yield_now().await;
            current()
        }));
        let task_b = tokio::spawn(scope(b, async {
            tokio::task::yield_now().await;
            current()
        }));

        assert_eq!(task_a.await.unwrap(), "req-a");
        assert_eq!(task_b.await.unwrap(), "req-b");
    }

    #[test]
    fn test_caller_supplied_ids() {
        assert!(TraceId::try_from("abc-123_DEF").is_ok());
        assert_eq!(TraceId::try_from(""), Err(TraceIdError::Empty));
        assert_eq!(
            TraceId::try_from("has spaces"),
            Err(TraceIdError::InvalidChars)
        );
        let long = "a".repeat(129);
        assert_eq!(
            TraceId::try_from(long.as_str()),
            Err(TraceIdError::TooLong)
        );
        let max = "a".repeat(128);
        assert!(TraceId::try_from(max.as_str()).is_ok());
    }
}
