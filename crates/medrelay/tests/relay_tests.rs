//! End-to-end tests of the relay over HTTP
//!
//! Each test runs the full router against a wiremock upstream that speaks
//! the Coze v3 chat API, then parses the relay's own event stream.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use medrelay_server::config::Config;
use medrelay_server::server::{AppState, create_router};
use medrelay_server::testing::{self, RelayFrame, SseBody, parse_relay_frames};

// =============================================================================
// Test Fixtures
// =============================================================================

fn router(config: &Config) -> Router {
    create_router(Arc::new(AppState::new(config, None)))
}

async fn mount_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/v3/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(server)
        .await;
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn data_frames(frames: &[RelayFrame]) -> Vec<&Value> {
    frames.iter().filter_map(RelayFrame::data).collect()
}

// =============================================================================
// Streaming
// =============================================================================

mod streaming_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_for_named_doctor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .and(header("authorization", "Bearer pat_test_token"))
            .and(body_partial_json(json!({"bot_id": testing::TEST_BOT_ID, "stream": true})))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    SseBody::new()
                        .created()
                        .delta("Rest ")
                        .delta("and fluids.")
                        .answer("Rest and fluids.")
                        .follow_up("How long will it last?")
                        .completed(Some((12, 30)))
                        .done()
                        .build(),
                    "text/event-stream",
                ),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json(
                "/api/chat/stream",
                json!({"message": "I have a cold", "user_id": "u1", "doctor_type": "wang"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        assert_eq!(response.headers()["cache-control"], "no-cache");
        assert!(response.headers().contains_key("x-conversation-id"));

        let frames = parse_relay_frames(&body_text(response).await);
        assert_eq!(frames.last(), Some(&RelayFrame::EndOfStream));

        let data = data_frames(&frames);
        assert_eq!(data[0]["type"], "init");
        assert_eq!(data[0]["message"], "connected");
        assert_eq!(data[0]["done"], false);

        let text: String = data
            .iter()
            .filter(|f| f["type"] == "message")
            .map(|f| f["content"].as_str().unwrap())
            .collect();
        assert_eq!(text, "Rest and fluids.");

        let completes: Vec<_> = data.iter().filter(|f| f["type"] == "complete").collect();
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0]["done"], true);
        assert_eq!(completes[0]["usage"]["token_count"], 42);
        assert_eq!(
            completes[0]["follow_up_questions"],
            json!(["How long will it last?"])
        );
        assert_eq!(data.last().unwrap()["type"], "complete");
    }

    #[tokio::test]
    async fn test_request_id_matches_frames() {
        let server = MockServer::start().await;
        mount_stream(&server, SseBody::new().delta("ok").completed(None).build()).await;

        let mut request = post_json("/api/chat/stream", json!({"message": "hi", "user_id": "u1"}));
        request
            .headers_mut()
            .insert("x-request-id", "trace-123".parse().unwrap());

        let response = router(&testing::config(&server.uri()))
            .oneshot(request)
            .await
            .unwrap();
        let request_id = response.headers()["x-request-id"]
            .to_str()
            .unwrap()
            .to_string();
        assert_ne!(request_id, "trace-123");

        let frames = parse_relay_frames(&body_text(response).await);
        let data = data_frames(&frames);
        assert!(data.len() >= 3);
        assert!(data.iter().all(|f| f["request_id"] == request_id.as_str()));
    }

    #[tokio::test]
    async fn test_caller_conversation_id_echoed() {
        let server = MockServer::start().await;
        mount_stream(&server, SseBody::new().delta("ok").completed(None).build()).await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json(
                "/api/chat/stream",
                json!({"message": "hi", "user_id": "u1", "conversation_id": "conv-abc"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.headers()["x-conversation-id"], "conv-abc");
    }

    #[tokio::test]
    async fn test_upstream_failure_event_ends_stream() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            SseBody::new()
                .delta("Partial")
                .failed("quota exceeded")
                .delta("never relayed")
                .build(),
        )
        .await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json("/api/chat/stream", json!({"message": "hi", "user_id": "u1"})))
            .await
            .unwrap();

        let frames = parse_relay_frames(&body_text(response).await);
        let data = data_frames(&frames);
        let kinds: Vec<&str> = data.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["init", "message", "error"]);
        assert_eq!(data[2]["error"], "quota exceeded");
        assert_eq!(data[2]["done"], true);
        assert_eq!(frames.last(), Some(&RelayFrame::EndOfStream));
    }

    #[tokio::test]
    async fn test_malformed_upstream_events_skipped() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            SseBody::new()
                .delta("A")
                .garbage()
                .delta("B")
                .completed(None)
                .build(),
        )
        .await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json("/api/chat/stream", json!({"message": "hi", "user_id": "u1"})))
            .await
            .unwrap();

        let frames = parse_relay_frames(&body_text(response).await);
        let kinds: Vec<&str> = frames.iter().filter_map(RelayFrame::kind).collect();
        assert_eq!(kinds, vec!["init", "message", "message", "complete"]);
    }

    #[tokio::test]
    async fn test_heartbeats_while_upstream_is_slow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        SseBody::new().delta("late").completed(None).build(),
                        "text/event-stream",
                    )
                    .set_delay(Duration::from_millis(2500)),
            )
            .mount(&server)
            .await;

        let mut config = testing::config(&server.uri());
        config.server.heartbeat_interval_secs = 1;

        let response = router(&config)
            .oneshot(post_json("/api/chat/stream", json!({"message": "hi", "user_id": "u1"})))
            .await
            .unwrap();

        let frames = parse_relay_frames(&body_text(response).await);
        let first_message = frames
            .iter()
            .position(|f| f.kind() == Some("message"))
            .unwrap();
        let heartbeats = frames[..first_message]
            .iter()
            .filter(|f| **f == RelayFrame::Heartbeat)
            .count();

        assert!(heartbeats >= 1, "expected heartbeats before the answer: {frames:?}");
        assert_eq!(frames[0].kind(), Some("init"));
        assert_eq!(frames.last(), Some(&RelayFrame::EndOfStream));
    }
}

// =============================================================================
// Retry and failure handling
// =============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_exhausted_retries_yield_single_error_frame() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json("/api/chat/stream", json!({"message": "hi", "user_id": "u1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frames = parse_relay_frames(&body_text(response).await);
        let kinds: Vec<&str> = frames.iter().filter_map(RelayFrame::kind).collect();
        assert_eq!(kinds, vec!["init", "error"]);

        let error = data_frames(&frames)[1];
        assert_eq!(error["done"], true);
        assert!(error["error"].as_str().unwrap().contains("3 attempts"));
        assert_eq!(frames.last(), Some(&RelayFrame::EndOfStream));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_stream(&server, SseBody::new().delta("second try").completed(None).build()).await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json("/api/chat/stream", json!({"message": "hi", "user_id": "u1"})))
            .await
            .unwrap();

        let frames = parse_relay_frames(&body_text(response).await);
        let kinds: Vec<&str> = frames.iter().filter_map(RelayFrame::kind).collect();
        assert_eq!(kinds, vec!["init", "message", "complete"]);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .expect(1)
            .mount(&server)
            .await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json("/api/chat/stream", json!({"message": "hi", "user_id": "u1"})))
            .await
            .unwrap();

        let frames = parse_relay_frames(&body_text(response).await);
        let kinds: Vec<&str> = frames.iter().filter_map(RelayFrame::kind).collect();
        assert_eq!(kinds, vec!["init", "error"]);
    }

    #[tokio::test]
    async fn test_unknown_doctor_streams_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json(
                "/api/chat/stream",
                json!({"message": "hi", "user_id": "u1", "doctor_type": "nobody"}),
            ))
            .await
            .unwrap();

        let frames = parse_relay_frames(&body_text(response).await);
        let data = data_frames(&frames);
        assert_eq!(data.len(), 2);
        assert_eq!(data[1]["type"], "error");
        assert!(data[1]["error"].as_str().unwrap().contains("nobody"));
    }
}

// =============================================================================
// References
// =============================================================================

mod reference_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_without_references_then_lookup() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            SseBody::new()
                .delta("Take ibuprofen.")
                .delta("\n")
                .delta("\n[1] NICE guideline")
                .delta("\n[2] BNF entry")
                .completed(None)
                .build(),
        )
        .await;

        let app = router(&testing::config(&server.uri()));
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/chat/stream-no-references",
                json!({"message": "hi", "user_id": "u1", "conversation_id": "conv-77"}),
            ))
            .await
            .unwrap();

        let frames = parse_relay_frames(&body_text(response).await);
        let text: String = data_frames(&frames)
            .iter()
            .filter(|f| f["type"] == "message")
            .map(|f| f["content"].as_str().unwrap())
            .collect();
        assert_eq!(text, "Take ibuprofen.");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/chat/references/conv-77")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["references"], "[1] NICE guideline\n[2] BNF entry");
    }

    #[tokio::test]
    async fn test_lookup_unknown_conversation_is_empty() {
        let response = router(&testing::config("http://127.0.0.1:9"))
            .oneshot(
                Request::builder()
                    .uri("/api/chat/references/never-seen")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["references"], "");
    }
}

// =============================================================================
// Single-shot chat
// =============================================================================

mod single_shot_tests {
    use super::*;

    async fn mount_completed_chat(server: &MockServer, answer: &str) {
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": {"id": "chat-1", "conversation_id": "up-1", "status": "in_progress"}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/chat/retrieve"))
            .and(query_param("chat_id", "chat-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": {"id": "chat-1", "conversation_id": "up-1", "status": "completed",
                         "usage": {"token_count": 9, "input_count": 4, "output_count": 5}}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/chat/message/list"))
            .and(query_param("conversation_id", "up-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": [
                    {"role": "user", "type": "question", "content": "hi"},
                    {"role": "assistant", "type": "answer", "content": answer},
                    {"role": "assistant", "type": "follow_up", "content": "Any fever?"}
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_single_shot_message() {
        let server = MockServer::start().await;
        mount_completed_chat(&server, "Drink water.\n\n[1] Source").await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json(
                "/api/chat/message",
                json!({"message": "hi", "user_id": "u1", "conversation_id": "conv-5"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["content"], "Drink water.\n\n[1] Source");
        assert_eq!(json["conversation_id"], "conv-5");
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["usage"]["token_count"], 9);
        assert_eq!(json["follow_up_questions"], json!(["Any fever?"]));
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_single_shot_without_references() {
        let server = MockServer::start().await;
        mount_completed_chat(&server, "Drink water.\n\n[1] Source").await;

        let app = router(&testing::config(&server.uri()));
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/chat/message-no-references",
                json!({"message": "hi", "user_id": "u1", "conversation_id": "conv-6"}),
            ))
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["content"], "Drink water.");
        assert_eq!(json["references"], "[1] Source");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/chat/references/conv-6")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["references"], "[1] Source");
    }

    #[tokio::test]
    async fn test_single_shot_upstream_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 4100, "msg": "authentication is invalid"
            })))
            .mount(&server)
            .await;

        let response = router(&testing::config(&server.uri()))
            .oneshot(post_json(
                "/api/chat/message",
                json!({"message": "hi", "user_id": "u1", "conversation_id": "conv-7"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["content"], "");
        assert_eq!(json["conversation_id"], "conv-7");
        assert!(
            json["error"]
                .as_str()
                .unwrap()
                .contains("authentication is invalid")
        );
    }

    #[tokio::test]
    async fn test_single_shot_slow_upstream_returns_response_object() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 0, "msg": "", "data": null}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let mut config = testing::config(&server.uri());
        config.server.request_timeout_secs = 1;

        let response = router(&config)
            .oneshot(post_json(
                "/api/chat/message",
                json!({"message": "hi", "user_id": "u1", "conversation_id": "conv-8"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["content"], "");
        assert_eq!(json["conversation_id"], "conv-8");
        assert_eq!(json["user_id"], "u1");
        assert!(json["error"].as_str().unwrap().contains("did not finish"));
    }
}
