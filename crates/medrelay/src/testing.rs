//! Test utilities shared by unit and integration tests
//!
//! - Tenant and config fixtures pointing at a mock upstream
//! - A builder for Coze-shaped SSE bodies
//! - A parser for the relay's own output frames

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::config::{Config, TenantConfig};
use crate::upstream::SseDecoder;

pub const TEST_TOKEN: &str = "pat_test_token";
pub const TEST_BOT_ID: &str = "bot-test";

/// Tenant profile against `base_url` with fast retries
pub fn tenant_config(base_url: &str) -> TenantConfig {
    TenantConfig {
        api_token: Some(TEST_TOKEN.to_string()),
        base_url: base_url.to_string(),
        bot_id: TEST_BOT_ID.to_string(),
        timeout_secs: 5,
        max_retries: 3,
        retry_delay_ms: 10,
        ..Default::default()
    }
}

/// Config with a `default` and a `wang` tenant, both against `base_url`
pub fn config(base_url: &str) -> Config {
    let mut tenants = BTreeMap::new();
    tenants.insert("default".to_string(), tenant_config(base_url));
    let mut wang = tenant_config(base_url);
    wang.name = Some("Dr. Wang".to_string());
    wang.specialty = Some("General surgery".to_string());
    tenants.insert("wang".to_string(), wang);

    Config {
        tenants,
        ..Default::default()
    }
}

/// Builder for upstream SSE bodies in the Coze v3 shape
#[derive(Debug, Default)]
pub struct SseBody {
    out: String,
}

impl SseBody {
    pub fn new() -> Self {
        Self::default()
    }

    fn event(mut self, name: &str, data: Value) -> Self {
        self.out.push_str(&format!("event:{name}\ndata:{data}\n\n"));
        self
    }

    pub fn created(self) -> Self {
        self.event(
            "conversation.chat.created",
            json!({"id": "chat-1", "conversation_id": "conv-1", "status": "created"}),
        )
    }

    pub fn delta(self, text: &str) -> Self {
        self.event(
            "conversation.message.delta",
            json!({"id": "msg-1", "conversation_id": "conv-1", "role": "assistant",
                   "type": "answer", "content": text, "content_type": "text"}),
        )
    }

    /// Full-message event for the answer; carries no new text for the relay
    pub fn answer(self, text: &str) -> Self {
        self.event(
            "conversation.message.completed",
            json!({"id": "msg-1", "role": "assistant", "type": "answer",
                   "content": text, "content_type": "text"}),
        )
    }

    pub fn follow_up(self, question: &str) -> Self {
        self.event(
            "conversation.message.completed",
            json!({"id": "msg-2", "role": "assistant", "type": "follow_up",
                   "content": question, "content_type": "text"}),
        )
    }

    /// Chat completion, optionally with `(input, output)` token counts
    pub fn completed(self, usage: Option<(u64, u64)>) -> Self {
        let mut data = json!({"id": "chat-1", "conversation_id": "conv-1", "status": "completed"});
        if let Some((input, output)) = usage {
            data["usage"] = json!({
                "token_count": input + output,
                "input_count": input,
                "output_count": output,
            });
        }
        self.event("conversation.chat.completed", data)
    }

    pub fn failed(self, message: &str) -> Self {
        self.event(
            "conversation.chat.failed",
            json!({"id": "chat-1", "status": "failed",
                   "last_error": {"code": 5000, "msg": message}}),
        )
    }

    /// Raw, unparseable data line
    pub fn garbage(mut self) -> Self {
        self.out
            .push_str("event:conversation.message.delta\ndata:{not json\n\n");
        self
    }

    pub fn done(self) -> Self {
        self.event("done", json!("[DONE]"))
    }

    pub fn build(self) -> String {
        self.out
    }
}

/// One frame of relay output
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Data(Value),
    Heartbeat,
    EndOfStream,
    Other(String),
}

impl RelayFrame {
    pub fn data(&self) -> Option<&Value> {
        match self {
            RelayFrame::Data(value) => Some(value),
            _ => None,
        }
    }

    /// `type` of a data frame
    pub fn kind(&self) -> Option<&str> {
        self.data().and_then(|v| v["type"].as_str())
    }
}

/// Split a relay response body into frames
pub fn parse_relay_frames(body: &str) -> Vec<RelayFrame> {
    SseDecoder::decode_all(body)
        .into_iter()
        .map(|frame| match frame.comment.as_deref() {
            Some(c) if frame.data.is_empty() && c.starts_with("heartbeat") => RelayFrame::Heartbeat,
            Some(c) if frame.data.is_empty() && c.starts_with("end-of-stream") => {
                RelayFrame::EndOfStream
            }
            _ => match serde_json::from_str(&frame.data) {
                Ok(value) => RelayFrame::Data(value),
                Err(_) => RelayFrame::Other(frame.data),
            },
        })
        .collect()
}
