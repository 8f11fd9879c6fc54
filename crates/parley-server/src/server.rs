//! `ParleyServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::heartbeat;
use crate::registry::ConnectionRegistry;
use crate::service::{ChatService, Stores};
use crate::shutdown::{ShutdownCoordinator, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
}

pub struct ParleyServer {
    config: Arc<ServerConfig>,
    state: AppState,
    dispatcher_task: JoinHandle<()>,
}

impl ParleyServer {
    /// Wire the service graph and start the dispatcher. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: ServerConfig, stores: Stores) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let (dispatcher, dispatcher_task) = Dispatcher::spawn(
            registry.clone(),
            stores.directory.clone(),
            config.dispatch_queue,
            config.retry.clone(),
            shutdown.token(),
        );
        let service = Arc::new(ChatService::new(stores, dispatcher, config.clone()));
        Self {
            config,
            state: AppState {
                service,
                registry,
                shutdown,
                start_time: Instant::now(),
            },
            dispatcher_task,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .merge(api::routes())
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    pub fn service(&self) -> &Arc<ChatService> {
        &self.state.service
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Bind `host:port` and serve until [`ServerHandle::shutdown`].
    pub async fn listen(self) -> std::io::Result<ServerHandle> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.state.shutdown.token();
        let server_task = tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
                tracing::error!(error = %e, "server stopped with error");
            }
        });

        let reaper_task = heartbeat::start_idle_reaper(
            self.state.registry.clone(),
            self.config.heartbeat_interval(),
            self.config.idle_timeout(),
            self.state.shutdown.token(),
        );

        info!(addr = %local_addr, "parley server listening");
        Ok(ServerHandle {
            addr: local_addr,
            registry: self.state.registry.clone(),
            shutdown: self.state.shutdown.clone(),
            tasks: vec![server_task, reaper_task, self.dispatcher_task],
        })
    }
}

/// Handle returned by [`ParleyServer::listen`]; keeps the background tasks
/// and stops them on [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn shutdown(self) {
        self.shutdown
            .graceful_shutdown(&self.registry, self.tasks, DEFAULT_SHUTDOWN_TIMEOUT)
            .await;
        info!("parley server stopped");
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.shutdown.is_shutting_down() { "shutting_down" } else { "ok" },
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.registry.count(),
    })
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        run_ws_session(
            socket,
            state.service.clone(),
            state.registry.clone(),
            state.shutdown.token(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use parley_core::ids::UserId;
    use parley_store::{Database, SqliteChatStore};
    use tower::ServiceExt;

    fn make_server() -> (ParleyServer, SqliteChatStore) {
        let store = SqliteChatStore::new(Database::in_memory().unwrap());
        let server = ParleyServer::new(ServerConfig::default(), Stores::sqlite(store.clone()));
        (server, store)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn authed(method: &str, uri: &str, token: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (server, _) = make_server();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert!(parsed["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn api_requires_bearer_token() {
        let (server, _) = make_server();
        let req = Request::builder().uri("/api/conversations").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["code"], "UNAUTHORIZED");

        let resp = server
            .router()
            .oneshot(authed("GET", "/api/conversations", "plt_wrong", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn verify_returns_user_id() {
        let (server, store) = make_server();
        let token = store.issue_token(UserId::from_raw("alice"), None).await.unwrap();
        let resp = server
            .router()
            .oneshot(authed("GET", "/api/auth/verify", &token, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["userId"], "alice");
    }

    #[tokio::test]
    async fn self_chat_is_bad_request() {
        let (server, store) = make_server();
        let token = store.issue_token(UserId::from_raw("alice"), None).await.unwrap();
        let resp = server
            .router()
            .oneshot(authed(
                "POST",
                "/api/direct-chats",
                &token,
                Some(serde_json::json!({"recipientId": "alice"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "INVALID_PARTICIPANTS");
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let (server, store) = make_server();
        let token = store.issue_token(UserId::from_raw("alice"), None).await.unwrap();
        let resp = server
            .router()
            .oneshot(authed(
                "POST",
                "/api/messages",
                &token,
                Some(serde_json::json!({"text": "no conversation"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn send_then_fetch_history() {
        let (server, store) = make_server();
        let token = store.issue_token(UserId::from_raw("alice"), None).await.unwrap();
        let app = server.router();

        let resp = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/direct-chats",
                &token,
                Some(serde_json::json!({"recipientId": "bob"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let chat = body_json(resp).await;
        assert_eq!(chat["chat"]["kind"], "direct");
        let conv = chat["chat"]["id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/messages",
                &token,
                Some(serde_json::json!({"conversationId": conv, "text": "hi"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(body_json(resp).await["message"]["seq"], 1);

        let resp = app
            .oneshot(authed("GET", &format!("/api/messages/{conv}?limit=10"), &token, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let page = body_json(resp).await;
        assert_eq!(page["hasMore"], false);
        assert_eq!(page["messages"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (server, _) = make_server();
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let (server, _) = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_shuts_down() {
        let (server, _) = make_server();
        let handle = server.listen().await.unwrap();
        assert_ne!(handle.port(), 0);
        handle.shutdown().await;
    }
}
