//! HTTP handlers.

use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tether_core::{Identity, StopMode};
use tether_session::transport::http_gateway::{Dispatch, WebhookPayload};
use tether_session::{StatusResponse, StopResponse};
use tracing::{debug, info, warn};

use crate::errors::ApiError;
use crate::health::{HealthResponse, HealthSample};
use crate::metrics::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL, WEBHOOKS_TOTAL};
use crate::server::AppState;
use crate::websocket::run_ws_session;

/// Header carrying the gateway's shared key on webhooks.
pub const API_KEY_HEADER: &str = "x-api-key";

/// `POST /v1/session/start` body.
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    /// Identity to start; optional when the caller has exactly one.
    #[serde(default)]
    pub identity: Option<Identity>,
}

/// `POST /v1/session/stop` body.
#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    /// Identity to stop; optional when the caller has exactly one.
    #[serde(default)]
    pub identity: Option<Identity>,
    /// `pause` (default) or `logout`.
    #[serde(default)]
    pub mode: StopMode,
}

/// `?identity=` query.
#[derive(Debug, Default, Deserialize)]
pub struct IdentityQuery {
    /// Identity to read.
    #[serde(default)]
    pub identity: Option<Identity>,
}

/// `/v1/session/ws` query.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Identity to follow.
    #[serde(default)]
    pub identity: Option<Identity>,
    /// Bearer token for clients that cannot set headers.
    #[serde(default)]
    pub token: Option<String>,
}

/// Webhook query.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    /// Gateway session name, when not in the body.
    #[serde(default)]
    pub session: Option<String>,
}

/// An empty body means "all defaults".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::invalid_params(format!("Invalid JSON: {e}")))
}

/// POST /v1/session/start
pub async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let caller = state.verifier.authenticate(&headers, None)?;
    let request: StartRequest = parse_body(&body)?;
    let status = state.gateway.start(&caller, request.identity.as_ref()).await?;
    Ok(Json(status))
}

/// POST /v1/session/stop
pub async fn stop_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StopResponse>, ApiError> {
    let caller = state.verifier.authenticate(&headers, None)?;
    let request: StopRequest = parse_body(&body)?;
    let response = state
        .gateway
        .stop(&caller, request.identity.as_ref(), request.mode)
        .await?;
    Ok(Json(response))
}

/// GET /v1/session/status
pub async fn session_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<IdentityQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let caller = state.verifier.authenticate(&headers, None)?;
    Ok(Json(state.gateway.status(&caller, query.identity.as_ref())?))
}

/// GET /v1/session/ws
///
/// Authentication and authorization happen before the upgrade, so a
/// rejected client gets a plain HTTP error.
pub async fn session_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let caller = state.verifier.authenticate(&headers, query.token.as_deref())?;
    if state.connections.is_full() {
        return Err(ApiError::Unavailable("too many connections".into()));
    }
    let (snapshot, subscriber) = state.gateway.subscribe(&caller, query.identity.as_ref())?;
    debug!(user = %caller.user_id, identity = %subscriber.identity(), "upgrading status socket");
    let max_message_size = state.config.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, state, caller, snapshot, subscriber)))
}

/// POST /v1/webhooks/gateway
///
/// Always answers 200 once the key checks out; a webhook for a session no
/// live worker owns is acknowledged and dropped.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Some(router) = &state.webhooks else {
        return Err(ApiError::NotFound("gateway webhooks are not enabled".into()));
    };
    let Some(expected) = state.webhook_key.as_deref() else {
        warn!("webhook received but no gateway api key is configured");
        return Err(ApiError::Configuration);
    };
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if !key_matches(presented, expected) {
        counter!(WEBHOOKS_TOTAL, "outcome" => "rejected").increment(1);
        return Err(ApiError::Unauthenticated("Invalid API key".into()));
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid_params(format!("Invalid webhook body: {e}")))?;
    let outcome = match router.dispatch(query.session.as_deref(), &payload) {
        Dispatch::Delivered(n) => {
            info!(event = %payload.event, delivered = n, "gateway webhook delivered");
            "delivered"
        }
        Dispatch::Ignored => "ignored",
        Dispatch::UnknownSession => "unknown_session",
    };
    counter!(WEBHOOKS_TOTAL, "outcome" => outcome).increment(1);
    Ok(Json(json!({ "ok": true, "outcome": outcome })))
}

/// Compare a presented API key without leaking how much of it matched.
fn key_matches(presented: Option<&str>, expected: &str) -> bool {
    presented.is_some_and(|key| bool::from(key.as_bytes().ct_eq(expected.as_bytes())))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.gateway.registry();
    Json(HealthResponse::from(HealthSample {
        started: state.start_time,
        draining: state.shutdown.is_shutting_down(),
        sockets: state.connections.count(),
        live_workers: registry.len(),
        spawned_workers: registry.spawned_total(),
        webhook_routes: state.webhooks.as_ref().map(|router| router.len()),
    }))
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => ApiError::NotFound("metrics recorder not installed".into()).into_response(),
    }
}

/// Request counter and latency histogram, labelled by matched route.
pub async fn track_http(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_owned(), |p| p.as_str().to_owned());
    let start = Instant::now();
    let response = next.run(request).await;
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method,
        "route" => route.clone(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}
