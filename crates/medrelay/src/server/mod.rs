//! HTTP server for the relay
//!
//! Routes:
//! - `GET  /` and `GET /api/health`
//! - `POST /api/chat/stream` and `POST /api/chat/stream-no-references`
//! - `GET  /api/chat/references/{conversation_id}`
//! - `POST /api/chat/message` and `POST /api/chat/message-no-references`
//! - `GET  /api/chat/bot-info`, `GET /api/chat/doctors`
//! - `POST /api/chat/reload-config`

pub mod handlers;
pub mod middleware;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, ServerConfig};
use crate::error::{RelayError, Result};
use crate::service::ChatService;

use handlers::*;
use middleware::{build_cors_layer, trace_requests};

/// Shared application state for all handlers
pub struct AppState {
    pub service: Arc<ChatService>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(config: &Config, config_path: Option<PathBuf>) -> Self {
        Self {
            service: Arc::new(ChatService::new(config, config_path)),
            config: config.server.clone(),
        }
    }
}

pub struct RelayServer {
    config: Config,
    config_path: Option<PathBuf>,
}

impl RelayServer {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Bind the listener and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let state = Arc::new(AppState::new(&self.config, self.config_path.clone()));
        let app = create_router(state);

        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting relay server on {addr}");
        tracing::info!(
            "Tenants: {} configured, default '{}'",
            self.config.tenants.len(),
            self.config.default_tenant
        );
        if self.config.server.cors_origins.is_empty() {
            tracing::info!("CORS: any origin");
        } else {
            tracing::info!("CORS: {} origins allowed", self.config.server.cors_origins.len());
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::General(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| RelayError::General(format!("Server error: {e}")))?;

        tracing::info!("Relay server shut down gracefully");
        Ok(())
    }
}

/// Extra time the router allows past the request timeout before cutting a
/// non-streaming request off with a bare 408
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Create the router with all routes configured
///
/// Single-shot chat bounds itself by the request timeout; the router-level
/// timeout on non-streaming routes only backs that up. Streaming routes
/// live as long as the relay does.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config);

    let streaming: Router<Arc<AppState>> = Router::new()
        .route("/api/chat/stream", post(stream_chat_handler))
        .route(
            "/api/chat/stream-no-references",
            post(stream_chat_no_references_handler),
        );

    let api: Router<Arc<AppState>> = Router::new()
        .route("/", get(root_handler))
        .route("/api/health", get(health_handler))
        .route("/api/chat/message", post(single_chat_handler))
        .route(
            "/api/chat/message-no-references",
            post(single_chat_no_references_handler),
        )
        .route(
            "/api/chat/references/{conversation_id}",
            get(references_handler),
        )
        .route("/api/chat/bot-info", get(bot_info_handler))
        .route("/api/chat/doctors", get(doctors_handler))
        .route("/api/chat/reload-config", post(reload_handler))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.config.request_timeout() + TIMEOUT_GRACE,
        ));

    Router::new()
        .merge(streaming)
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(trace_requests))
        .layer(cors)
        .with_state(state)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let config = testing::config("http://127.0.0.1:9");
        create_router(Arc::new(AppState::new(&config, None)))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_root_endpoint() {
        let response = test_router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["health"], "/api/health");
    }

    #[tokio::test]
    async fn test_caller_trace_id_not_reused() {
        let app = test_router();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/api/health")
                        .header("x-request-id", "client-abc")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let id = response.headers()["x-request-id"].to_str().unwrap().to_string();
            assert_ne!(id, "client-abc");
            assert_eq!(id.len(), 36);
            ids.push(id);
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_invalid_trace_id_replaced() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .header("x-request-id", "bad id!")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert_ne!(id, "bad id!");
        assert_eq!(id.len(), 36);
    }

    #[tokio::test]
    async fn test_empty_message_rejected_before_streaming() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat/stream")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "   ", "user_id": "u1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["type"], "validation");
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat/message")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("Invalid request"));
    }

    #[tokio::test]
    async fn test_references_for_unknown_conversation() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/chat/references/unknown-conv")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["conversation_id"], "unknown-conv");
        assert_eq!(json["references"], "");
        assert_eq!(json["success"], true);
    }

    #[tokio::test]
    async fn test_doctors_listing() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/chat/doctors")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[1]["id"], "wang");
        assert_eq!(data[1]["name"], "Dr. Wang");
    }

    #[tokio::test]
    async fn test_bot_info_unknown_tenant() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/chat/bot-info?doctor_type=nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "config");
    }

    #[tokio::test]
    async fn test_bot_info_known_tenant() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/chat/bot-info?doctor_type=wang")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["bot_id"], testing::TEST_BOT_ID);
        assert_eq!(json["data"]["status"], "active");
    }

    #[tokio::test]
    async fn test_reload_without_config_file() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat/reload-config")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);
    }

    #[tokio::test]
    async fn test_cors_preflight_exposes_trace_header() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/chat/stream")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }
}
