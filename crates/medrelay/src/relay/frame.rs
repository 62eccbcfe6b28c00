//! Byte-level framing of the client-facing event stream
//!
//! Data frames are `data: <json>\n\n`. Heartbeats and the end-of-stream
//! marker are SSE comments, which browsers' `EventSource` ignores.

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;

use super::event::NormalizedEvent;
use crate::error::Result;

/// Message carried by the initial frame
pub const INIT_MESSAGE: &str = "connected";

#[derive(Serialize)]
struct WireFrame<'a> {
    #[serde(flatten)]
    event: &'a NormalizedEvent,
    done: bool,
    request_id: &'a str,
}

#[derive(Serialize)]
struct InitFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'static str,
    done: bool,
    request_id: &'a str,
}

fn data_frame(json: Vec<u8>) -> Bytes {
    let mut buf = Vec::with_capacity(json.len() + 8);
    buf.extend_from_slice(b"data: ");
    buf.extend_from_slice(&json);
    buf.extend_from_slice(b"\n\n");
    Bytes::from(buf)
}

/// First frame of every relay
pub fn init(request_id: &str) -> Result<Bytes> {
    let json = serde_json::to_vec(&InitFrame {
        kind: "init",
        message: INIT_MESSAGE,
        done: false,
        request_id,
    })?;
    Ok(data_frame(json))
}

/// Encode one event, stamping `done` and the request id
pub fn event(event: &NormalizedEvent, request_id: &str) -> Result<Bytes> {
    let json = serde_json::to_vec(&WireFrame {
        event,
        done: event.is_terminal(),
        request_id,
    })?;
    Ok(data_frame(json))
}

/// Error frame built without going through serde, for when encoding failed
pub fn fallback_error(message: &str, request_id: &str) -> Bytes {
    let value = serde_json::json!({
        "type": "error",
        "error": message,
        "done": true,
        "request_id": request_id,
    });
    data_frame(value.to_string().into_bytes())
}

pub fn heartbeat() -> Bytes {
    Bytes::from(format!(": heartbeat {}\n\n", Utc::now().timestamp()))
}

pub fn end_of_stream() -> Bytes {
    Bytes::from(format!(": end-of-stream {}\n\n", Utc::now().timestamp()))
}
