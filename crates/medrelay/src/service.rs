//! Chat service: the per-request pipeline behind every chat endpoint
//!
//! Streaming requests run one sequential pipeline per request:
//!
//! ```text
//! registry.resolve -> retry(open stream) -> SSE decode -> normalize
//!     -> (no-references mode) split citations -> RelayEncoder
//! ```
//!
//! The pipeline is a lazy stream; nothing touches the upstream until the
//! response body is first polled, and dropping the body drops the
//! upstream connection with it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::models::{ChatRequest, ChatResponse, ReferencesResponse, Usage};
use crate::references::{ReferenceCache, ReferenceSplitter, split_references};
use crate::registry::{TenantRegistry, TenantSummary};
use crate::relay::encoder::UNTERMINATED_STREAM;
use crate::relay::{NormalizedEvent, RelayEncoder};
use crate::trace::TraceId;
use crate::upstream::{CozeClient, EventNormalizer, RetryPolicy, UpstreamFrames};

/// Pause between status polls of a single-shot chat
pub const CHAT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Normalized events of one request, terminated by `Complete` or `Error`
pub type EventStream = Pin<Box<dyn Stream<Item = Result<NormalizedEvent>> + Send>>;

/// Whether citation blocks are relayed inline or withheld and cached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    WithReferences,
    WithoutReferences,
}

/// Bot identity of a tenant
#[derive(Debug, Clone, Serialize)]
pub struct BotInfo {
    pub tenant: String,
    pub bot_id: String,
    pub base_url: String,
    pub status: &'static str,
}

pub struct ChatService {
    registry: Arc<TenantRegistry>,
    references: Arc<ReferenceCache>,
    heartbeat_interval: Duration,
    single_shot_timeout: Duration,
    config_path: Option<PathBuf>,
}

impl ChatService {
    pub fn new(config: &Config, config_path: Option<PathBuf>) -> Self {
        Self {
            registry: Arc::new(TenantRegistry::new(
                config.default_tenant.clone(),
                config.tenants.clone(),
            )),
            references: Arc::new(ReferenceCache::from_config(&config.references)),
            heartbeat_interval: config.server.heartbeat_interval(),
            single_shot_timeout: config.server.request_timeout(),
            config_path,
        }
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn references(&self) -> &ReferenceCache {
        &self.references
    }

    /// Normalized event stream for a prepared request
    pub fn event_stream(&self, mut request: ChatRequest, mode: RelayMode) -> EventStream {
        let conversation_id = request.ensure_conversation_id().to_string();
        let state = Pipeline::Opening {
            registry: self.registry.clone(),
            cache: self.references.clone(),
            request,
            conversation_id,
            mode,
        };

        Box::pin(stream::unfold(state, Pipeline::step))
    }

    /// Framed relay for a prepared request
    pub fn relay(
        &self,
        request: ChatRequest,
        mode: RelayMode,
        trace_id: TraceId,
    ) -> RelayEncoder<EventStream> {
        RelayEncoder::new(
            self.event_stream(request, mode),
            trace_id,
            self.heartbeat_interval,
        )
    }

    /// Non-streaming chat: create, poll until done, then fetch messages
    ///
    /// Falls back to collecting the streaming variant when the chat does
    /// not finish within the tenant timeout or its messages cannot be
    /// listed. The whole exchange is bounded by the server request timeout.
    pub async fn chat_single(&self, mut request: ChatRequest, mode: RelayMode) -> Result<ChatResponse> {
        let conversation_id = request.ensure_conversation_id().to_string();
        let client = self.registry.resolve(request.doctor_type.as_deref())?;

        let answer = tokio::time::timeout(
            self.single_shot_timeout,
            fetch_answer(&client, &request, &conversation_id),
        )
        .await
        .map_err(|_| {
            RelayError::TransientUpstream(format!(
                "single-shot chat did not finish within {:?}",
                self.single_shot_timeout
            ))
        })??;

        let (content, references) = match mode {
            RelayMode::WithReferences => (answer.content, None),
            RelayMode::WithoutReferences => {
                let (body, references) = split_references(&answer.content);
                if references.is_empty() {
                    (body, None)
                } else {
                    self.references.store(&conversation_id, references.clone());
                    (body, Some(references))
                }
            }
        };

        info!(
            conversation_id = %conversation_id,
            chars = content.len(),
            follow_ups = answer.follow_ups.len(),
            "Single-shot chat completed"
        );

        Ok(ChatResponse {
            content,
            conversation_id,
            user_id: request.user_id,
            usage: answer.usage,
            follow_up_questions: answer.follow_ups,
            references,
            error: None,
        })
    }

    /// Cached references of a conversation; empty when none are cached
    pub fn lookup_references(&self, conversation_id: &str) -> ReferencesResponse {
        let references = self.references.get(conversation_id).unwrap_or_default();
        debug!(conversation_id, found = !references.is_empty(), "Reference lookup");
        ReferencesResponse {
            conversation_id: conversation_id.to_string(),
            references,
            success: true,
        }
    }

    pub fn doctors(&self) -> Vec<TenantSummary> {
        self.registry.summaries()
    }

    pub fn bot_info(&self, tenant: Option<&str>) -> Result<BotInfo> {
        let client = self.registry.resolve(tenant)?;
        let settings = client.settings();
        Ok(BotInfo {
            tenant: settings.key.clone(),
            bot_id: settings.bot_id.clone(),
            base_url: settings.base_url.clone(),
            status: "active",
        })
    }

    /// Re-read the configuration file and drop every cached client
    ///
    /// Only the tenant table is reloaded; server and cache settings need a
    /// restart.
    pub fn reload(&self) -> Result<String> {
        match &self.config_path {
            Some(path) => {
                let config = Config::load(path)?;
                let tenants = config.tenants.len();
                self.registry
                    .replace_tenants(config.default_tenant, config.tenants);
                info!(path = %path.display(), tenants, "Configuration reloaded");
                Ok(format!(
                    "reloaded {tenants} tenant(s) from {}",
                    path.display()
                ))
            }
            None => {
                self.registry.invalidate_all();
                Ok("no configuration file in use; tenant clients reset".to_string())
            }
        }
    }
}

enum Pipeline {
    Opening {
        registry: Arc<TenantRegistry>,
        cache: Arc<ReferenceCache>,
        request: ChatRequest,
        conversation_id: String,
        mode: RelayMode,
    },
    Streaming(Box<ActiveRelay>),
    Finished,
}

impl Pipeline {
    async fn step(self) -> Option<(Result<NormalizedEvent>, Pipeline)> {
        match self {
            Pipeline::Finished => None,
            Pipeline::Streaming(active) => active.advance().await,
            Pipeline::Opening {
                registry,
                cache,
                request,
                conversation_id,
                mode,
            } => match open_upstream(&registry, &request).await {
                Ok(upstream) => {
                    let active = ActiveRelay {
                        upstream,
                        normalizer: EventNormalizer::new(),
                        splitter: (mode == RelayMode::WithoutReferences)
                            .then(ReferenceSplitter::new),
                        cache,
                        conversation_id,
                        queue: VecDeque::new(),
                    };
                    Box::new(active).advance().await
                }
                Err(e) => Some((Err(e), Pipeline::Finished)),
            },
        }
    }
}

async fn open_upstream(registry: &TenantRegistry, request: &ChatRequest) -> Result<UpstreamFrames> {
    let client = registry.resolve(request.doctor_type.as_deref())?;
    let policy = client.retry_policy();

    info!(
        tenant = %client.settings().key,
        max_attempts = policy.max_attempts,
        "Opening upstream chat stream"
    );

    policy
        .run("open chat stream", |attempt| {
            debug!(attempt, "Stream open attempt");
            client.open_chat_stream(request)
        })
        .await
}

/// Request-local state once the upstream stream is open
struct ActiveRelay {
    upstream: UpstreamFrames,
    normalizer: EventNormalizer,
    splitter: Option<ReferenceSplitter>,
    cache: Arc<ReferenceCache>,
    conversation_id: String,
    queue: VecDeque<NormalizedEvent>,
}

impl ActiveRelay {
    async fn advance(mut self: Box<Self>) -> Option<(Result<NormalizedEvent>, Pipeline)> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                let next = if event.is_terminal() {
                    Pipeline::Finished
                } else {
                    Pipeline::Streaming(self)
                };
                return Some((Ok(event), next));
            }

            match self.upstream.next().await {
                Some(Ok(frame)) => {
                    if let Some(event) = self.normalizer.normalize(&frame) {
                        self.accept(event);
                    }
                }
                Some(Err(e)) => return Some((Err(e), Pipeline::Finished)),
                None => {
                    let err = RelayError::MidStreamUpstream(UNTERMINATED_STREAM.to_string());
                    return Some((Err(err), Pipeline::Finished));
                }
            }
        }
    }

    fn accept(&mut self, event: NormalizedEvent) {
        let Some(splitter) = self.splitter.as_mut() else {
            self.queue.push_back(event);
            return;
        };

        match event {
            NormalizedEvent::Message { content } => {
                if let Some(visible) = splitter.push(&content) {
                    self.queue.push_back(NormalizedEvent::message(visible));
                }
            }
            complete @ NormalizedEvent::Complete { .. } => {
                let (rest, references) = splitter.finish();
                if let Some(rest) = rest {
                    self.queue.push_back(NormalizedEvent::message(rest));
                }
                if !references.is_empty() {
                    self.cache.store(&self.conversation_id, references);
                }
                self.queue.push_back(complete);
            }
            other => self.queue.push_back(other),
        }
    }
}

#[derive(Debug, Default)]
struct CollectedAnswer {
    content: String,
    follow_ups: Vec<String>,
    usage: Option<Usage>,
}

async fn fetch_answer(
    client: &CozeClient,
    request: &ChatRequest,
    conversation_id: &str,
) -> Result<CollectedAnswer> {
    let policy = client.retry_policy();
    match poll_chat(client, request, policy).await? {
        Some(answer) => Ok(answer),
        None => {
            warn!(conversation_id = %conversation_id, "Falling back to streamed collection");
            collect_stream(client, request, policy).await
        }
    }
}

/// `Ok(None)` means the caller should fall back to streaming
async fn poll_chat(
    client: &CozeClient,
    request: &ChatRequest,
    policy: RetryPolicy,
) -> Result<Option<CollectedAnswer>> {
    let mut chat = policy
        .run("create chat", |_| client.create_chat(request))
        .await?;
    let deadline = Instant::now() + client.settings().timeout;

    while chat.is_pending() {
        if Instant::now() >= deadline {
            warn!(chat_id = %chat.id, "Chat still pending at timeout");
            return Ok(None);
        }
        tokio::time::sleep(CHAT_POLL_INTERVAL).await;
        chat = client.retrieve_chat(&chat.conversation_id, &chat.id).await?;
    }

    if !chat.is_completed() {
        warn!(
            chat_id = %chat.id,
            status = %chat.status,
            error = chat.last_error.as_ref().map(|e| e.msg.as_str()).unwrap_or(""),
            "Chat did not complete"
        );
        return Ok(None);
    }

    let messages = match client.list_messages(&chat.conversation_id, &chat.id).await {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "Failed to list chat messages");
            return Ok(None);
        }
    };

    let mut answer = CollectedAnswer {
        usage: chat.usage.map(Usage::from),
        ..Default::default()
    };
    for message in messages.into_iter().filter(|m| m.role == "assistant") {
        match message.kind.as_str() {
            "answer" => answer.content.push_str(&message.content),
            "follow_up" => answer.follow_ups.push(message.content),
            _ => {}
        }
    }

    if answer.content.is_empty() {
        return Ok(None);
    }
    Ok(Some(answer))
}

async fn collect_stream(
    client: &CozeClient,
    request: &ChatRequest,
    policy: RetryPolicy,
) -> Result<CollectedAnswer> {
    let mut upstream = policy
        .run("open chat stream", |_| client.open_chat_stream(request))
        .await?;
    let mut normalizer = EventNormalizer::new();
    let mut answer = CollectedAnswer::default();

    while let Some(frame) = upstream.next().await {
        match normalizer.normalize(&frame?) {
            Some(NormalizedEvent::Message { content }) => answer.content.push_str(&content),
            Some(NormalizedEvent::FollowUp { questions }) => answer.follow_ups.extend(questions),
            Some(NormalizedEvent::Complete { usage, follow_ups }) => {
                answer.usage = usage;
                answer.follow_ups.extend(follow_ups);
                return Ok(answer);
            }
            Some(NormalizedEvent::Error { message }) => {
                return Err(RelayError::MidStreamUpstream(message));
            }
            None => {}
        }
    }

    Err(RelayError::MidStreamUpstream(UNTERMINATED_STREAM.to_string()))
}
