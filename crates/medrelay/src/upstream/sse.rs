//! Incremental server-sent-event decoding
//!
//! Upstream bodies arrive as arbitrary byte chunks. The decoder buffers
//! partial lines (including split UTF-8 sequences) and yields one
//! [`SseFrame`] per blank-line-terminated block:
//!
//! ```text
//! event: conversation.message.delta
//! data: {"content":"Hello"}
//!
//! : keep-alive comment
//!
//! ```

use std::collections::VecDeque;
use std::fmt::Display;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::error::{RelayError, Result};

/// One decoded SSE block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    /// Value of the `event:` field, if present
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// Comment text of a comment-only block
    pub comment: Option<String>,
}

impl SseFrame {
    pub fn is_comment(&self) -> bool {
        self.event.is_none() && self.data.is_empty() && self.comment.is_some()
    }
}

/// Stateful decoder fed with raw body chunks
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is left once the body has ended
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    /// Decode a complete body in one go
    pub fn decode_all(raw: &str) -> Vec<SseFrame> {
        let mut decoder = Self::new();
        let mut frames = decoder.push(raw.as_bytes());
        frames.extend(decoder.finish());
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }

        if let Some(comment) = line.strip_prefix(':') {
            if self.current.comment.is_none() {
                self.current.comment = Some(comment.trim_start().to_string());
            }
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }

        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let frame = std::mem::take(&mut self.current);
        self.has_data = false;
        if frame.event.is_none() && frame.data.is_empty() && frame.comment.is_none() {
            None
        } else {
            Some(frame)
        }
    }
}

/// Turn a byte stream into a stream of decoded frames
///
/// A transport error ends the stream after being yielded once as
/// [`RelayError::MidStreamUpstream`].
pub fn frames<S, E>(body: S) -> impl Stream<Item = Result<SseFrame>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display,
{
    let state = (Box::pin(body), SseDecoder::new(), VecDeque::new(), false);

    stream::unfold(
        state,
        |(mut body, mut decoder, mut pending, mut ended)| async move {
            loop {
                if let Some(frame) = pending.pop_front() {
                    return Some((Ok(frame), (body, decoder, pending, ended)));
                }
                if ended {
                    return None;
                }
                match body.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        ended = true;
                        let err = RelayError::MidStreamUpstream(format!(
                            "failed to read upstream body: {e}"
                        ));
                        return Some((Err(err), (body, decoder, pending, ended)));
                    }
                    None => {
                        ended = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    )
}
