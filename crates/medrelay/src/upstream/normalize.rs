//! Mapping of Coze v3 chat events onto [`NormalizedEvent`]
//!
//! The upstream payload is deserialized into [`WirePayload`], an explicit
//! schema whose every field is optional and leniently typed: a field of an
//! unexpected JSON type reads as absent instead of failing the whole item.
//! Text increments are looked up in a fixed order:
//!
//! 1. `message.content`
//! 2. `data.content`
//! 3. `delta.content`
//! 4. top-level `content`
//!
//! The first non-empty candidate wins. Items that match no known shape are
//! skipped; items that are not JSON objects at all are logged as malformed
//! and skipped. Neither ever ends the stream.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use super::sse::SseFrame;
use crate::error::{RelayError, Result};
use crate::models::Usage;
use crate::relay::NormalizedEvent;

/// Version tag of the upstream event schema understood here
pub const SCHEMA_VERSION: &str = "coze-v3";

/// Upstream event names
pub mod event_names {
    pub const CHAT_CREATED: &str = "conversation.chat.created";
    pub const CHAT_IN_PROGRESS: &str = "conversation.chat.in_progress";
    pub const MESSAGE_DELTA: &str = "conversation.message.delta";
    pub const MESSAGE_COMPLETED: &str = "conversation.message.completed";
    pub const CHAT_COMPLETED: &str = "conversation.chat.completed";
    pub const CHAT_FAILED: &str = "conversation.chat.failed";
    pub const CHAT_REQUIRES_ACTION: &str = "conversation.chat.requires_action";
    pub const ERROR: &str = "error";
    pub const DONE: &str = "done";
}

/// Message sub-type marking a suggested follow-up question
const FOLLOW_UP_TYPE: &str = "follow_up";

const DEFAULT_FAILURE_MESSAGE: &str = "upstream reported a failed chat";

fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Nested object that may carry text, a sub-type, usage or an error
#[derive(Debug, Default, Deserialize)]
pub struct WireBody {
    #[serde(default, deserialize_with = "lenient")]
    pub content: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub usage: Option<WireUsage>,
    #[serde(default, deserialize_with = "lenient")]
    pub last_error: Option<WireError>,
    #[serde(default, deserialize_with = "lenient")]
    pub msg: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub input_count: u64,
    #[serde(default)]
    pub output_count: u64,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            token_count: u.token_count,
            input_count: u.input_count,
            output_count: u.output_count,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct WireError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// One upstream event payload
///
/// Coze sends the message or chat object itself as the payload, so its
/// own fields (`content`, `type`, `usage`, `last_error`) sit at the top
/// level; older and proxied shapes nest them under `message`, `data`,
/// `delta` or `chat`.
#[derive(Debug, Default, Deserialize)]
pub struct WirePayload {
    #[serde(default, deserialize_with = "lenient")]
    pub event: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub message: Option<WireBody>,
    #[serde(default, deserialize_with = "lenient")]
    pub data: Option<WireBody>,
    #[serde(default, deserialize_with = "lenient")]
    pub delta: Option<WireBody>,
    #[serde(default, deserialize_with = "lenient")]
    pub chat: Option<WireBody>,
    #[serde(default, deserialize_with = "lenient")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub usage: Option<WireUsage>,
    #[serde(default, deserialize_with = "lenient")]
    pub last_error: Option<WireError>,
    #[serde(default, deserialize_with = "lenient")]
    pub msg: Option<String>,
}

impl WirePayload {
    /// Incremental text, first non-empty candidate in lookup order
    pub fn delta_text(&self) -> Option<&str> {
        [
            self.message.as_ref().and_then(|b| b.content.as_deref()),
            self.data.as_ref().and_then(|b| b.content.as_deref()),
            self.delta.as_ref().and_then(|b| b.content.as_deref()),
            self.content.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
    }

    /// Message sub-type (`answer`, `follow_up`, ...)
    fn sub_type(&self) -> Option<&str> {
        self.kind
            .as_deref()
            .or_else(|| self.message.as_ref().and_then(|b| b.kind.as_deref()))
            .or_else(|| self.data.as_ref().and_then(|b| b.kind.as_deref()))
    }

    /// Usage statistics from `usage`, `chat.usage` or `data.usage`
    fn usage(&self) -> Option<Usage> {
        self.usage
            .or_else(|| self.chat.as_ref().and_then(|b| b.usage))
            .or_else(|| self.data.as_ref().and_then(|b| b.usage))
            .map(Usage::from)
    }

    fn failure_message(&self) -> String {
        let nested = |b: &WireBody| {
            b.last_error
                .as_ref()
                .map(|e| e.msg.clone())
                .or_else(|| b.msg.clone())
        };

        self.last_error
            .as_ref()
            .map(|e| e.msg.clone())
            .or_else(|| self.msg.clone())
            .or_else(|| self.chat.as_ref().and_then(nested))
            .or_else(|| self.data.as_ref().and_then(nested))
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string())
    }
}

/// Per-request normalizer; owns the follow-up accumulator
#[derive(Debug, Default)]
pub struct EventNormalizer {
    follow_ups: Vec<String>,
    finished: bool,
    skipped: usize,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has been produced
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of items dropped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Map one upstream frame to zero or one event
    pub fn normalize(&mut self, frame: &SseFrame) -> Option<NormalizedEvent> {
        if self.finished {
            return None;
        }

        match self.interpret(frame) {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            Ok(None) => None,
            Err(e) => {
                self.skipped += 1;
                warn!(error = %e, event = ?frame.event, "Skipping upstream item");
                None
            }
        }
    }

    fn interpret(&mut self, frame: &SseFrame) -> Result<Option<NormalizedEvent>> {
        if frame.is_comment() {
            return Ok(None);
        }

        if frame.event.as_deref() == Some(event_names::DONE) {
            debug!("Upstream end marker");
            return Ok(None);
        }

        let data = frame.data.trim();
        if data.is_empty() {
            self.skipped += 1;
            return Ok(None);
        }

        let payload: WirePayload = serde_json::from_str(data).map_err(|e| {
            RelayError::MalformedEvent(format!("{e} (schema {SCHEMA_VERSION})"))
        })?;

        let discriminant = frame.event.as_deref().or(payload.event.as_deref());

        let event = match discriminant {
            Some(event_names::MESSAGE_DELTA) | None => {
                payload.delta_text().map(NormalizedEvent::message)
            }
            Some(event_names::MESSAGE_COMPLETED) => {
                if payload.sub_type() == Some(FOLLOW_UP_TYPE) {
                    if let Some(question) = payload.delta_text() {
                        debug!(question, "Collected follow-up question");
                        self.follow_ups.push(question.to_string());
                    }
                }
                None
            }
            Some(event_names::CHAT_COMPLETED) => Some(NormalizedEvent::Complete {
                usage: payload.usage(),
                follow_ups: std::mem::take(&mut self.follow_ups),
            }),
            Some(event_names::CHAT_FAILED) | Some(event_names::ERROR) => {
                Some(NormalizedEvent::error(payload.failure_message()))
            }
            Some(other) => {
                debug!(event = other, "Ignoring upstream event");
                None
            }
        };

        if event.is_none() {
            self.skipped += 1;
        }

        Ok(event)
    }
}
