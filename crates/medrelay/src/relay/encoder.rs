//! Relay encoder state machine
//!
//! Drives a stream of [`NormalizedEvent`]s into wire frames:
//!
//! ```text
//! Init -> Streaming -> Complete -> Closed
//!                   \-> Error   -/
//! ```
//!
//! The init frame goes out before the first upstream event is awaited so
//! the transport flushes headers immediately. While streaming, an idle gap
//! longer than the heartbeat interval produces a comment frame. Every
//! relay ends with exactly one terminal data frame followed by the
//! end-of-stream marker, whatever the producer did.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use super::event::NormalizedEvent;
use super::frame;
use crate::error::Result;
use crate::trace::{self, TraceId};

/// Message of the synthesized error when the producer ends without a
/// terminal event
pub const UNTERMINATED_STREAM: &str = "upstream stream ended before the chat completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Streaming,
    Complete,
    Error,
    Closed,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Complete | RelayState::Error)
    }
}

pub struct RelayEncoder<S> {
    events: Option<S>,
    state: RelayState,
    trace_id: TraceId,
    heartbeat: Duration,
    last_frame: Instant,
    relayed: usize,
    heartbeats: usize,
}

impl<S> RelayEncoder<S>
where
    S: Stream<Item = Result<NormalizedEvent>> + Unpin + Send + 'static,
{
    pub fn new(events: S, trace_id: TraceId, heartbeat: Duration) -> Self {
        Self {
            events: Some(events),
            state: RelayState::Init,
            trace_id,
            heartbeat,
            last_frame: Instant::now(),
            relayed: 0,
            heartbeats: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Produce the next frame, or `None` once closed
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        match self.state {
            RelayState::Init => {
                self.state = RelayState::Streaming;
                match frame::init(self.trace_id.as_str()) {
                    Ok(bytes) => Some(self.mark(bytes)),
                    Err(e) => Some(self.fail_encoding(e.to_string())),
                }
            }
            RelayState::Streaming => Some(self.next_streaming_frame().await),
            RelayState::Complete | RelayState::Error => {
                info!(
                    state = ?self.state,
                    relayed = self.relayed,
                    heartbeats = self.heartbeats,
                    "Relay closed"
                );
                self.state = RelayState::Closed;
                self.events = None;
                Some(frame::end_of_stream())
            }
            RelayState::Closed => None,
        }
    }

    async fn next_streaming_frame(&mut self) -> Bytes {
        let Some(events) = self.events.as_mut() else {
            return self.emit(NormalizedEvent::error(UNTERMINATED_STREAM));
        };

        let deadline = self.last_frame + self.heartbeat;
        match tokio::time::timeout_at(deadline, events.next()).await {
            Err(_) => {
                self.heartbeats += 1;
                debug!(heartbeats = self.heartbeats, "Upstream idle, sending heartbeat");
                self.mark(frame::heartbeat())
            }
            Ok(Some(Ok(event))) => self.emit(event),
            Ok(Some(Err(e))) => {
                error!(category = e.category(), error = %e, "Relay producer failed");
                self.emit(NormalizedEvent::error(e.to_string()))
            }
            Ok(None) => {
                warn!("Upstream ended without a terminal event");
                self.emit(NormalizedEvent::error(UNTERMINATED_STREAM))
            }
        }
    }

    fn emit(&mut self, event: NormalizedEvent) -> Bytes {
        match frame::event(&event, self.trace_id.as_str()) {
            Ok(bytes) => {
                self.relayed += 1;
                match event {
                    NormalizedEvent::Complete { .. } => self.terminate(RelayState::Complete),
                    NormalizedEvent::Error { .. } => self.terminate(RelayState::Error),
                    _ => {}
                }
                self.mark(bytes)
            }
            Err(e) => self.fail_encoding(e.to_string()),
        }
    }

    fn fail_encoding(&mut self, reason: String) -> Bytes {
        error!(error = %reason, "Failed to encode relay frame");
        self.terminate(RelayState::Error);
        self.mark(frame::fallback_error(&reason, self.trace_id.as_str()))
    }

    /// Enter a terminal state and release the upstream handle
    fn terminate(&mut self, state: RelayState) {
        self.state = state;
        self.events = None;
    }

    fn mark(&mut self, bytes: Bytes) -> Bytes {
        self.last_frame = Instant::now();
        bytes
    }

    /// Adapt into an HTTP body stream
    ///
    /// The body is polled after the handler has returned, so each step
    /// re-enters the request's trace scope and span.
    pub fn into_body_stream(
        self,
    ) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
        let span = self.trace_id.span();

        stream::unfold(self, move |mut encoder| {
            let id = encoder.trace_id.clone();
            let step = async move {
                let frame = encoder.next_frame().await?;
                Some((Ok(frame), encoder))
            };
            trace::scope(id, step.instrument(span.clone()))
        })
    }
}
