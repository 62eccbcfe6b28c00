//! HTTP client for the Coze v3 chat API
//!
//! One [`CozeClient`] exists per tenant. It owns the tenant's resolved
//! credential and a pooled `reqwest::Client`, and is shared by every
//! request routed to that tenant.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::normalize::{WireError, WireUsage};
use super::retry::RetryPolicy;
use super::sse::{self, SseFrame};
use crate::config::TenantConfig;
use crate::error::{RelayError, Result};
use crate::models::{ChatRequest, MessageRole};

/// Decoded upstream frames of one open chat stream
pub type UpstreamFrames = Pin<Box<dyn Stream<Item = Result<SseFrame>> + Send>>;

/// Statuses the provider uses for temporary conditions
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Resolved, immutable connection settings of one tenant
#[derive(Clone)]
pub struct TenantSettings {
    pub key: String,
    credential: String,
    pub base_url: String,
    pub bot_id: String,
    pub default_user_id: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for TenantSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSettings")
            .field("key", &self.key)
            .field("credential", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("bot_id", &self.bot_id)
            .field("default_user_id", &self.default_user_id)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl TenantSettings {
    /// Resolve a tenant profile, failing if it cannot be used
    pub fn resolve(key: &str, profile: &TenantConfig) -> Result<Self> {
        let credential = profile.resolve_credential().map_err(|e| match e {
            RelayError::Config(msg) => RelayError::Config(format!("tenant '{key}': {msg}")),
            other => other,
        })?;

        if profile.bot_id.trim().is_empty() {
            return Err(RelayError::Config(format!(
                "tenant '{key}': bot_id is not configured"
            )));
        }

        url::Url::parse(&profile.base_url).map_err(|e| {
            RelayError::Config(format!(
                "tenant '{key}': invalid base_url '{}': {e}",
                profile.base_url
            ))
        })?;

        Ok(Self {
            key: key.to_string(),
            credential,
            base_url: profile.base_url.trim_end_matches('/').to_string(),
            bot_id: profile.bot_id.clone(),
            default_user_id: profile.default_user_id.clone(),
            timeout: profile.timeout(),
            retry: RetryPolicy::new(profile.max_retries, profile.retry_delay()),
        })
    }
}

/// Body of `POST /v3/chat`
#[derive(Debug, Serialize)]
struct CreateChatBody<'a> {
    bot_id: &'a str,
    user_id: &'a str,
    stream: bool,
    auto_save_history: bool,
    additional_messages: Vec<AdditionalMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AdditionalMessage<'a> {
    role: &'static str,
    content: &'a str,
    content_type: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> AdditionalMessage<'a> {
    fn question(content: &'a str) -> Self {
        Self {
            role: "user",
            content,
            content_type: "text",
            kind: "question",
        }
    }

    fn answer(content: &'a str) -> Self {
        Self {
            role: "assistant",
            content,
            content_type: "text",
            kind: "answer",
        }
    }
}

/// Standard `{code, msg, data}` envelope of the non-streaming endpoints
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

/// Chat object returned by create and retrieve
#[derive(Debug, Clone, Deserialize)]
pub struct ChatObject {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub usage: Option<WireUsage>,
    #[serde(default)]
    pub last_error: Option<WireError>,
}

impl ChatObject {
    pub fn is_pending(&self) -> bool {
        matches!(self.status.as_str(), "created" | "in_progress")
    }

    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// One entry of `GET /v3/chat/message/list`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageObject {
    #[serde(default)]
    pub role: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
}

/// Upstream client for one tenant
#[derive(Debug)]
pub struct CozeClient {
    http: Client,
    settings: TenantSettings,
}

impl CozeClient {
    pub fn new(settings: TenantSettings) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(settings.timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))?;

        info!(
            tenant = %settings.key,
            base_url = %settings.base_url,
            bot_id = %settings.bot_id,
            "Upstream client initialized"
        );

        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &TenantSettings {
        &self.settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.settings.retry
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url, path)
    }

    fn body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> CreateChatBody<'a> {
        let mut messages: Vec<AdditionalMessage<'a>> = request
            .context
            .iter()
            .flatten()
            .filter(|m| !m.content.trim().is_empty())
            .filter_map(|m| match m.role {
                MessageRole::User => Some(AdditionalMessage::question(&m.content)),
                MessageRole::Assistant => Some(AdditionalMessage::answer(&m.content)),
                MessageRole::System => None,
            })
            .collect();
        messages.push(AdditionalMessage::question(&request.message));

        let user_id = if request.user_id.trim().is_empty() {
            self.settings.default_user_id.as_str()
        } else {
            request.user_id.as_str()
        };

        CreateChatBody {
            bot_id: &self.settings.bot_id,
            user_id,
            stream,
            auto_save_history: true,
            additional_messages: messages,
        }
    }

    /// Open a streaming chat; one attempt, no retry
    pub async fn open_chat_stream(&self, request: &ChatRequest) -> Result<UpstreamFrames> {
        let url = self.url("v3/chat");
        debug!(url = %url, tenant = %self.settings.key, "Opening upstream chat stream");

        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.credential)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&self.body(request, true))
            .send();

        let response = tokio::time::timeout(self.settings.timeout, send)
            .await
            .map_err(|_| {
                RelayError::TransientUpstream(format!(
                    "no response from upstream within {:?}",
                    self.settings.timeout
                ))
            })?
            .map_err(transport_error)?;

        let response = check_status(response).await?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if is_json {
            // Errors are sometimes reported as a JSON envelope with status 200
            let status = response.status().as_u16();
            let envelope: Envelope<serde_json::Value> = response
                .json()
                .await
                .map_err(|e| RelayError::TransientUpstream(e.to_string()))?;
            let message = if envelope.code != 0 {
                format!("code {}: {}", envelope.code, envelope.msg)
            } else {
                "expected an event stream, got a JSON body".to_string()
            };
            return Err(RelayError::Upstream { status, message });
        }

        Ok(Box::pin(sse::frames(response.bytes_stream())))
    }

    /// `POST /v3/chat` without streaming
    pub async fn create_chat(&self, request: &ChatRequest) -> Result<ChatObject> {
        let response = self
            .http
            .post(self.url("v3/chat"))
            .bearer_auth(&self.settings.credential)
            .timeout(self.settings.timeout)
            .json(&self.body(request, false))
            .send()
            .await
            .map_err(transport_error)?;

        read_envelope(response).await
    }

    /// `GET /v3/chat/retrieve`
    pub async fn retrieve_chat(&self, conversation_id: &str, chat_id: &str) -> Result<ChatObject> {
        let response = self
            .http
            .get(self.url("v3/chat/retrieve"))
            .bearer_auth(&self.settings.credential)
            .timeout(self.settings.timeout)
            .query(&[("conversation_id", conversation_id), ("chat_id", chat_id)])
            .send()
            .await
            .map_err(transport_error)?;

        read_envelope(response).await
    }

    /// `GET /v3/chat/message/list`
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        chat_id: &str,
    ) -> Result<Vec<ChatMessageObject>> {
        let response = self
            .http
            .get(self.url("v3/chat/message/list"))
            .bearer_auth(&self.settings.credential)
            .timeout(self.settings.timeout)
            .query(&[("conversation_id", conversation_id), ("chat_id", chat_id)])
            .send()
            .await
            .map_err(transport_error)?;

        read_envelope(response).await
    }
}

/// Failures before a response arrived are always worth another attempt
fn transport_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::TransientUpstream(format!("request timed out: {e}"))
    } else if e.is_connect() {
        RelayError::TransientUpstream(format!("connection failed: {e}"))
    } else {
        RelayError::TransientUpstream(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    let message = format!("{status}: {}", text.trim());

    if is_transient_status(status) {
        Err(RelayError::TransientUpstream(message))
    } else {
        Err(RelayError::Upstream {
            status: status.as_u16(),
            message: text.trim().to_string(),
        })
    }
}

async fn read_envelope<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response).await?;
    let status = response.status().as_u16();

    let envelope: Envelope<T> = response.json().await.map_err(|e| RelayError::Upstream {
        status,
        message: format!("unexpected response body: {e}"),
    })?;

    if envelope.code != 0 {
        return Err(RelayError::Upstream {
            status,
            message: format!("code {}: {}", envelope.code, envelope.msg),
        });
    }

    envelope.data.ok_or_else(|| RelayError::Upstream {
        status,
        message: "response carried no data".to_string(),
    })
}
