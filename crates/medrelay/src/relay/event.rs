//! The provider-neutral event vocabulary relayed to clients

use serde::{Deserialize, Serialize};

use crate::models::Usage;

/// One normalized chat event
///
/// Serialized with a lowercase `type` discriminator so the wire frame reads
/// `{"type":"message","content":"..."}`. `Complete` and `Error` are
/// terminal: nothing follows them but the end-of-stream marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    /// Incremental assistant text
    Message { content: String },

    /// Suggested next questions, surfaced ahead of completion
    FollowUp {
        #[serde(rename = "follow_up_questions")]
        questions: Vec<String>,
    },

    /// The provider finished the chat
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, rename = "follow_up_questions")]
        follow_ups: Vec<String>,
    },

    /// The chat failed; `message` is shown to the user
    Error {
        #[serde(rename = "error")]
        message: String,
    },
}

impl NormalizedEvent {
    pub fn message(content: impl Into<String>) -> Self {
        NormalizedEvent::Message {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        NormalizedEvent::Error {
            message: message.into(),
        }
    }

    /// Whether this event ends the relay
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NormalizedEvent::Complete { .. } | NormalizedEvent::Error { .. }
        )
    }

    /// Wire name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::Message { .. } => "message",
            NormalizedEvent::FollowUp { .. } => "follow_up",
            NormalizedEvent::Complete { .. } => "complete",
            NormalizedEvent::Error { .. } => "error",
        }
    }
}
