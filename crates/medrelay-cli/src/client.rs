//! HTTP client for a running medrelay daemon

use std::pin::Pin;

use futures::{Stream, StreamExt, stream};
use serde::de::DeserializeOwned;
use serde_json::Value;

use medrelay_server::models::{ChatRequest, ChatResponse, ReferencesResponse};
use medrelay_server::registry::TenantSummary;
use medrelay_server::trace::TRACE_HEADER;
use medrelay_server::upstream::{SseDecoder, SseFrame};

use crate::error::{CliError, CliResult};

pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8000";

/// One frame of the relay's event stream, as seen by a client
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Data(Value),
    Heartbeat,
    EndOfStream,
}

impl StreamFrame {
    /// `type` of a data frame
    pub fn kind(&self) -> Option<&str> {
        match self {
            StreamFrame::Data(value) => value["type"].as_str(),
            _ => None,
        }
    }

    fn from_sse(frame: SseFrame) -> Option<CliResult<Self>> {
        if let (Some(comment), true) = (frame.comment.as_deref(), frame.data.is_empty()) {
            return if comment.starts_with("heartbeat") {
                Some(Ok(StreamFrame::Heartbeat))
            } else if comment.starts_with("end-of-stream") {
                Some(Ok(StreamFrame::EndOfStream))
            } else {
                None
            };
        }
        if frame.data.is_empty() {
            return None;
        }
        Some(
            serde_json::from_str(&frame.data)
                .map(StreamFrame::Data)
                .map_err(|e| CliError(format!("Malformed relay frame: {e}"))),
        )
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = CliResult<StreamFrame>> + Send>>;

/// Opened streaming chat: the frames plus the ids the relay assigned
pub struct ChatStream {
    pub request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub frames: FrameStream,
}

pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn health(&self) -> CliResult<Value> {
        self.get_json("/api/health").await
    }

    pub async fn doctors(&self) -> CliResult<Vec<TenantSummary>> {
        let body: Value = self.get_json("/api/chat/doctors").await?;
        Ok(serde_json::from_value(body["data"].clone())?)
    }

    pub async fn bot_info(&self, doctor: Option<&str>) -> CliResult<Value> {
        let mut request = self.http.get(self.url("/api/chat/bot-info"));
        if let Some(doctor) = doctor {
            request = request.query(&[("doctor_type", doctor)]);
        }
        let body: Value = read_json(request.send().await?).await?;
        Ok(body["data"].clone())
    }

    pub async fn references(&self, conversation_id: &str) -> CliResult<ReferencesResponse> {
        self.get_json(&format!("/api/chat/references/{conversation_id}"))
            .await
    }

    pub async fn reload(&self) -> CliResult<String> {
        let response = self
            .http
            .post(self.url("/api/chat/reload-config"))
            .send()
            .await?;
        let body: Value = read_json(response).await?;
        Ok(body["message"].as_str().unwrap_or_default().to_string())
    }

    /// Single-shot chat; relay-reported failures come back as errors
    pub async fn message(&self, request: &ChatRequest, with_references: bool) -> CliResult<ChatResponse> {
        let path = if with_references {
            "/api/chat/message"
        } else {
            "/api/chat/message-no-references"
        };
        let response = self.http.post(self.url(path)).json(request).send().await?;
        let status = response.status();
        let body: ChatResponse = response.json().await?;
        match body.error {
            Some(error) => Err(CliError(format!("Relay returned {status}: {error}"))),
            None => Ok(body),
        }
    }

    /// Open a streaming chat and decode the relay's frames as they arrive
    pub async fn stream(&self, request: &ChatRequest, with_references: bool) -> CliResult<ChatStream> {
        let path = if with_references {
            "/api/chat/stream"
        } else {
            "/api/chat/stream-no-references"
        };
        let response = self.http.post(self.url(path)).json(request).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let request_id = header(TRACE_HEADER);
        let conversation_id = header("x-conversation-id");

        Ok(ChatStream {
            request_id,
            conversation_id,
            frames: Box::pin(decode_frames(response.bytes_stream())),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> CliResult<T> {
        let response = self.http.get(self.url(path)).send().await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> CliResult<T> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    Ok(response.json().await?)
}

async fn error_from_response(response: reqwest::Response) -> CliError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| match &v["error"] {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("message").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .unwrap_or(text);
    CliError(format!("Relay returned {status}: {message}"))
}

/// Turn a raw response body into relay frames
pub fn decode_frames<S, B>(body: S) -> impl Stream<Item = CliResult<StreamFrame>> + Send
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let decoded = stream::unfold(
        (Box::pin(body), SseDecoder::new(), false),
        |(mut body, mut decoder, ended)| async move {
            if ended {
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => {
                    let frames: Vec<CliResult<StreamFrame>> = decoder
                        .push(chunk.as_ref())
                        .into_iter()
                        .filter_map(StreamFrame::from_sse)
                        .collect();
                    Some((frames, (body, decoder, false)))
                }
                Some(Err(e)) => Some((
                    vec![Err(CliError(format!("Stream interrupted: {e}")))],
                    (body, decoder, true),
                )),
                None => {
                    let rest: Vec<CliResult<StreamFrame>> = decoder
                        .finish()
                        .and_then(StreamFrame::from_sse)
                        .into_iter()
                        .collect();
                    Some((rest, (body, decoder, true)))
                }
            }
        },
    );
    decoded.flat_map(stream::iter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(comment: Option<&str>, data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
            comment: comment.map(str::to_string),
        }
    }

    #[test]
    fn test_frame_classification() {
        assert_eq!(
            StreamFrame::from_sse(sse(Some("heartbeat 1700000000"), "")).unwrap().unwrap(),
            StreamFrame::Heartbeat
        );
        assert_eq!(
            StreamFrame::from_sse(sse(Some("end-of-stream 1700000000"), "")).unwrap().unwrap(),
            StreamFrame::EndOfStream
        );
        assert!(StreamFrame::from_sse(sse(Some("keepalive"), "")).is_none());

        let data = StreamFrame::from_sse(sse(None, r#"{"type":"message","content":"hi"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(data.kind(), Some("message"));
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(StreamFrame::from_sse(sse(None, "{nope")).unwrap().is_err());
    }

    #[tokio::test]
    async fn test_decode_frames_across_chunks() {
        let chunks: Vec<reqwest::Result<&'static [u8]>> = vec![
            Ok(&b"data: {\"type\":\"in"[..]),
            Ok(&b"it\"}\n\n: heartbeat 1\n"[..]),
            Ok(&b"\n: end-of-stream 2\n\n"[..]),
        ];
        let frames: Vec<StreamFrame> = decode_frames(stream::iter(chunks))
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind(), Some("init"));
        assert_eq!(frames[1], StreamFrame::Heartbeat);
        assert_eq!(frames[2], StreamFrame::EndOfStream);
    }

    #[test]
    fn test_url_joining() {
        let client = RelayClient::new("http://localhost:8000/");
        assert_eq!(client.url("/api/health"), "http://localhost:8000/api/health");
    }
}
