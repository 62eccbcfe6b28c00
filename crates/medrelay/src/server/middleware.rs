//! Request trace and CORS layers

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::trace::{self, TRACE_HEADER, TraceId};

/// Response header carrying the conversation id of a chat
pub const CONVERSATION_HEADER: &str = "x-conversation-id";

/// Give every request a fresh trace id
///
/// The relay always generates its own id so concurrent requests never
/// share one. A valid caller-supplied `x-request-id` is kept only as the
/// span's `client_request_id` field. The handler runs inside the trace
/// scope and the `request` span, and the generated id is echoed on the
/// response.
pub async fn trace_requests(request: Request, next: Next) -> Response {
    let client_id = request
        .headers()
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| TraceId::try_from(v).ok());
    let trace_id = TraceId::new();

    let span = trace_id.span();
    if let Some(client_id) = &client_id {
        span.record("client_request_id", client_id.as_str());
    }
    span.in_scope(|| {
        tracing::debug!(method = %request.method(), path = %request.uri().path(), "Request received")
    });

    let mut response = trace::scope(trace_id.clone(), next.run(request).instrument(span)).await;

    if let Ok(value) = HeaderValue::from_str(trace_id.as_str()) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

pub fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(TRACE_HEADER),
            HeaderName::from_static(CONVERSATION_HEADER),
        ]);

    if config.cors_origins.is_empty() || config.cors_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}
