//! Request and response types shared by the HTTP surface and the chat service

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RelayError, Result};

/// Author of one conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A prior turn supplied as context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Inbound chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The user's message; never empty once prepared
    pub message: String,
    /// Falls back to the tenant's `default_user_id` when blank
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Prior turns, oldest first
    #[serde(default)]
    pub context: Option<Vec<ChatMessage>>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Tenant (doctor profile) selector
    #[serde(default, alias = "tenant")]
    pub doctor_type: Option<String>,
    /// Structured form fields prepended to the message before dispatch
    #[serde(default)]
    pub form_data: Option<Map<String, Value>>,
}

fn default_stream() -> bool {
    true
}

impl ChatRequest {
    /// Build a minimal request, mostly useful for tests and tooling
    pub fn new(message: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_id: user_id.into(),
            conversation_id: None,
            context: None,
            stream: true,
            doctor_type: None,
            form_data: None,
        }
    }

    /// Conversation id, generating one if the caller supplied none
    pub fn ensure_conversation_id(&mut self) -> &str {
        self.conversation_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .as_str()
    }

    /// Merge `form_data` into `message` and check the result is usable
    ///
    /// Each non-empty form field becomes a `key: value` line; the block is
    /// placed before the message and separated from it by a blank line.
    pub fn prepare(mut self) -> Result<Self> {
        if let Some(form) = self.form_data.take() {
            let lines: Vec<String> = form
                .iter()
                .filter_map(|(key, value)| format_form_value(value).map(|v| format!("{key}: {v}")))
                .collect();

            if !lines.is_empty() {
                let block = lines.join("\n");
                self.message = if self.message.trim().is_empty() {
                    block
                } else {
                    format!("{block}\n\n{}", self.message)
                };
            }
        }

        if self.message.trim().is_empty() {
            return Err(RelayError::Validation("message must not be empty".to_string()));
        }

        Ok(self)
    }
}

fn format_form_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(format_form_value).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        other => Some(other.to_string()),
    }
}

/// Token accounting reported by the provider at chat completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub input_count: u64,
    #[serde(default)]
    pub output_count: u64,
}

/// Response of the single-shot chat endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_up_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatResponse {
    /// Error-populated response for a request that could not be served
    pub fn failed(conversation_id: String, user_id: String, error: &RelayError) -> Self {
        Self {
            content: String::new(),
            conversation_id,
            user_id,
            usage: None,
            follow_up_questions: Vec::new(),
            references: None,
            error: Some(error.to_string()),
        }
    }
}

/// Response of the reference lookup endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencesResponse {
    pub conversation_id: String,
    pub references: String,
    pub success: bool,
}
