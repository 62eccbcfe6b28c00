//! HTTP handlers for the chat API

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::AppState;
use super::middleware::CONVERSATION_HEADER;
use crate::error::RelayError;
use crate::models::{ChatRequest, ChatResponse};
use crate::service::RelayMode;
use crate::trace;

/// Tenant selector of query-string endpoints
#[derive(Debug, Default, Deserialize)]
pub struct TenantQuery {
    #[serde(default, alias = "tenant")]
    pub doctor_type: Option<String>,
}

pub async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "name": "medrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/api/health",
    }))
}

pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn stream_chat_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    relay_response(&state, payload, RelayMode::WithReferences)
}

pub async fn stream_chat_no_references_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    relay_response(&state, payload, RelayMode::WithoutReferences)
}

pub async fn single_chat_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    single_response(&state, payload, RelayMode::WithReferences).await
}

pub async fn single_chat_no_references_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    single_response(&state, payload, RelayMode::WithoutReferences).await
}

pub async fn references_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Response {
    Json(state.service.lookup_references(&conversation_id)).into_response()
}

pub async fn bot_info_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> Response {
    match state.service.bot_info(query.doctor_type.as_deref()) {
        Ok(info) => Json(json!({"success": true, "data": info})).into_response(),
        Err(e) => {
            warn!(error = %e, "Bot info lookup failed");
            error_response(&e)
        }
    }
}

pub async fn doctors_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({"success": true, "data": state.service.doctors()})).into_response()
}

pub async fn reload_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.reload() {
        Ok(message) => Json(json!({"success": true, "message": message})).into_response(),
        Err(e) => {
            error!(error = %e, "Configuration reload failed");
            error_response(&e)
        }
    }
}

/// Parse, stamp the stream flag and validate an inbound chat request
fn parse_request(
    payload: Result<Json<ChatRequest>, JsonRejection>,
    stream: bool,
) -> Result<ChatRequest, RelayError> {
    let Json(mut request) = payload.map_err(|e| RelayError::Validation(e.body_text()))?;
    request.stream = stream;
    request.prepare()
}

fn relay_response(
    state: &AppState,
    payload: Result<Json<ChatRequest>, JsonRejection>,
    mode: RelayMode,
) -> Response {
    let mut request = match parse_request(payload, true) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected chat request");
            return error_response(&e);
        }
    };

    let conversation_id = request.ensure_conversation_id().to_string();
    info!(
        conversation_id = %conversation_id,
        user_id = %request.user_id,
        tenant = request.doctor_type.as_deref().unwrap_or("default"),
        mode = ?mode,
        message_chars = request.message.chars().count(),
        "Starting chat relay"
    );

    let trace_id = trace::current_id().unwrap_or_default();
    let encoder = state.service.relay(request, mode, trace_id);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .header(header::TRANSFER_ENCODING, "chunked");

    if let Ok(value) = HeaderValue::from_str(&conversation_id) {
        builder = builder.header(CONVERSATION_HEADER, value);
    }

    builder
        .body(Body::from_stream(encoder.into_body_stream()))
        .unwrap_or_else(|e| {
            error_response(&RelayError::General(format!(
                "failed to build stream response: {e}"
            )))
        })
}

async fn single_response(
    state: &AppState,
    payload: Result<Json<ChatRequest>, JsonRejection>,
    mode: RelayMode,
) -> Response {
    let mut request = match parse_request(payload, false) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected chat request");
            let failed = ChatResponse::failed(String::new(), String::new(), &e);
            return (e.status_code(), Json(failed)).into_response();
        }
    };

    let conversation_id = request.ensure_conversation_id().to_string();
    let user_id = request.user_id.clone();

    match state.service.chat_single(request, mode).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            error!(
                conversation_id = %conversation_id,
                category = e.category(),
                error = %e,
                "Single-shot chat failed"
            );
            let failed = ChatResponse::failed(conversation_id, user_id, &e);
            (e.status_code(), Json(failed)).into_response()
        }
    }
}

/// JSON error body: `{"success": false, "error": {"type", "message"}}`
pub fn error_response(e: &RelayError) -> Response {
    let body = json!({
        "success": false,
        "error": {
            "type": e.category(),
            "message": e.to_string(),
        }
    });
    (e.status_code(), Json(body)).into_response()
}
