//! `TetherServer`: Axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tether_session::CommandGateway;
use tether_session::transport::http_gateway::{WEBHOOK_PATH, WebhookRouter};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::JwtVerifier;
use crate::config::ServerConfig;
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::ConnectionTracker;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Authorized entry point for session commands.
    pub gateway: Arc<CommandGateway>,
    /// Bearer token verifier.
    pub verifier: Arc<JwtVerifier>,
    /// Webhook fan-in for the HTTP gateway transport, when it is in use.
    pub webhooks: Option<Arc<WebhookRouter>>,
    /// Key expected in `X-Api-Key` on webhooks.
    pub webhook_key: Option<Arc<str>>,
    /// Live status sockets.
    pub connections: Arc<ConnectionTracker>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
}

/// The Tether server.
pub struct TetherServer {
    state: AppState,
}

impl TetherServer {
    /// Create a new server over `gateway`.
    pub fn new(config: ServerConfig, gateway: Arc<CommandGateway>, verifier: JwtVerifier) -> Self {
        Self {
            state: AppState {
                gateway,
                verifier: Arc::new(verifier),
                webhooks: None,
                webhook_key: None,
                connections: Arc::new(ConnectionTracker::new(config.max_connections)),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                metrics: None,
                config: Arc::new(config),
                start_time: Instant::now(),
            },
        }
    }

    /// Accept gateway webhooks, authenticated with `api_key`.
    #[must_use]
    pub fn with_webhooks(mut self, router: Arc<WebhookRouter>, api_key: Option<String>) -> Self {
        self.state.webhooks = Some(router);
        self.state.webhook_key = api_key.map(Arc::from);
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/session/start", post(routes::start_session))
            .route("/v1/session/stop", post(routes::stop_session))
            .route("/v1/session/status", get(routes::session_status))
            .route("/v1/session/ws", get(routes::session_ws))
            .route(WEBHOOK_PATH, post(routes::gateway_webhook))
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route_layer(middleware::from_fn(routes::track_http))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown is signalled.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server exited with error");
            }
        });
        info!(%addr, "listening");
        Ok((addr, handle))
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use tether_core::{
        Identity, MemoryCredentialStore, MemoryGrantStore, MemoryProjectionStore,
    };
    use tether_session::transport::scripted::{ScriptedBehavior, ScriptedTransportFactory};
    use tether_session::{
        GatewayConfig, GrantAuthorizer, PersistenceRetry, SessionRegistry, StatusPublisher,
        WorkerDeps, WorkerPolicy,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::auth::Claims;

    const SECRET: &str = "server-test-secret";

    fn make_server(secret: Option<&str>) -> TetherServer {
        let credentials = Arc::new(MemoryCredentialStore::new());
        let publisher = Arc::new(StatusPublisher::new(
            Arc::new(MemoryProjectionStore::new()),
            16,
            PersistenceRetry::default(),
        ));
        let registry = SessionRegistry::new(WorkerDeps {
            transports: Arc::new(ScriptedTransportFactory::with_behavior(
                ScriptedBehavior::AutoPair,
            )),
            credentials: credentials.clone(),
            sink: publisher.clone(),
            policy: Arc::new(WorkerPolicy::default()),
        });
        let grants = Arc::new(MemoryGrantStore::new());
        grants.grant("user-1", &Identity::from("op-1"));
        let gateway = CommandGateway::new(
            registry,
            publisher,
            credentials,
            Arc::new(GrantAuthorizer::new(grants)),
            GatewayConfig::default(),
        );
        TetherServer::new(
            ServerConfig::default(),
            Arc::new(gateway),
            JwtVerifier::new(secret, 0),
        )
    }

    fn token(sub: &str) -> String {
        let exp = u64::try_from(chrono::Utc::now().timestamp() + 600).unwrap();
        encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                sub: sub.into(),
                exp,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    async fn send(router: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn status_request(bearer: Option<&str>, identity: &str) -> Request<Body> {
        let mut builder = Request::builder().uri(format!("/v1/session/status?identity={identity}"));
        if let Some(bearer) = bearer {
            builder = builder.header("authorization", format!("Bearer {bearer}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server(Some(SECRET));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, json) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sockets"], 0);
        assert_eq!(json["workers"]["live"], 0);
        assert!(json.get("webhooks").is_none());
    }

    #[tokio::test]
    async fn status_requires_token() {
        let server = make_server(Some(SECRET));
        let (status, json) = send(server.router(), status_request(None, "op-1")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "AUTHENTICATION_ERROR");

        let (status, _) = send(server.router(), status_request(Some("garbage"), "op-1")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_of_fresh_identity_is_idle() {
        let server = make_server(Some(SECRET));
        let (status, json) =
            send(server.router(), status_request(Some(&token("user-1")), "op-1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["identity"], "op-1");
        assert_eq!(json["state"], "idle");
    }

    #[tokio::test]
    async fn foreign_identity_is_forbidden() {
        let server = make_server(Some(SECRET));
        let (status, json) =
            send(server.router(), status_request(Some(&token("user-1")), "op-2")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["code"], "AUTHORIZATION_ERROR");
        assert!(!server.state().gateway.registry().exists(&Identity::from("op-2")));
    }

    #[tokio::test]
    async fn missing_secret_is_configuration_error() {
        let server = make_server(None);
        let (status, json) =
            send(server.router(), status_request(Some(&token("user-1")), "op-1")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "Server configuration error");
    }

    #[tokio::test]
    async fn start_then_stop_over_http() {
        let server = make_server(Some(SECRET));
        let bearer = format!("Bearer {}", token("user-1"));

        let req = Request::builder()
            .method("POST")
            .uri("/v1/session/start")
            .header("authorization", &bearer)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"identity":"op-1"}"#))
            .unwrap();
        let (status, json) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(json["state"], "idle");
        assert!(server.state().gateway.registry().exists(&Identity::from("op-1")));

        // identity omitted: the caller's only grant is used
        let req = Request::builder()
            .method("POST")
            .uri("/v1/session/stop")
            .header("authorization", &bearer)
            .body(Body::from(r#"{"mode":"pause"}"#))
            .unwrap();
        let (status, json) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
        assert!(!server.state().gateway.registry().exists(&Identity::from("op-1")));
    }

    #[tokio::test]
    async fn webhooks_disabled_by_default() {
        let server = make_server(Some(SECRET));
        let req = Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .body(Body::from(r#"{"event":"session.status"}"#))
            .unwrap();
        let (status, _) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_checks_api_key() {
        let server = make_server(Some(SECRET))
            .with_webhooks(Arc::new(WebhookRouter::new()), Some("gw-key".into()));
        let body = r#"{"event":"session.status","session":"operator_op-9","payload":{"status":"WORKING"}}"#;

        let req = Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .header("x-api-key", "wrong")
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // same length, one byte off
        let req = Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .header("x-api-key", "gw-kez")
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .header("x-api-key", "gw-key")
            .body(Body::from(body))
            .unwrap();
        let (status, json) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "unknown_session");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let server = make_server(Some(SECRET));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let (status, _) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(Some(SECRET));
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_propagates_to_coordinator() {
        let server = make_server(Some(SECRET));
        assert!(!server.shutdown().is_shutting_down());
        server.shutdown().shutdown();
        assert!(server.shutdown().is_shutting_down());
    }
}
