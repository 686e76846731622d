//! Transport backed by an external REST messaging gateway.
//!
//! The gateway runs the actual network client. Each identity maps to a
//! gateway session named `operator_{identity}`. Commands go out as REST
//! calls authenticated with `X-Api-Key`; session status comes back as
//! webhooks, which the server hands to the shared [`WebhookRouter`] for
//! delivery into the matching transport's event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tether_core::{CredentialBlob, Identity, PairingMaterial, PairingMethod};
use tether_settings::GatewaySettings;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    DisconnectReason, EndReason, Transport, TransportCommand, TransportError, TransportEvent,
    TransportEvents, TransportFactory,
};

const API_KEY_HEADER: &str = "X-Api-Key";
const EVENT_BUFFER: usize = 32;
/// Path the server exposes for gateway webhooks.
pub const WEBHOOK_PATH: &str = "/v1/webhooks/gateway";

/// Gateway session name for `identity`.
#[must_use]
pub fn session_name(identity: &Identity) -> String {
    format!("operator_{identity}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Resolved gateway connection settings.
#[derive(Clone, Debug)]
pub struct HttpGatewayConfig {
    /// Gateway base URL without trailing slash.
    pub base_url: String,
    /// API key sent on every request and expected on webhooks.
    pub api_key: String,
    /// Full webhook URL registered with the gateway, if any.
    pub webhook_url: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl HttpGatewayConfig {
    /// Resolve from settings. Fails when the base URL or API key is missing.
    pub fn from_settings(settings: &GatewaySettings) -> Result<Self, TransportError> {
        let base_url = settings
            .base_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransportError::Fatal("gateway base URL not configured".into()))?;
        let api_key = settings
            .api_key
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransportError::Fatal("gateway API key not configured".into()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            webhook_url: settings
                .webhook_base_url
                .as_deref()
                .map(|base| format!("{}{WEBHOOK_PATH}", base.trim_end_matches('/'))),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Webhooks
// ─────────────────────────────────────────────────────────────────────────────

/// Inbound webhook body.
#[derive(Clone, Debug, Deserialize)]
pub struct WebhookPayload {
    /// Event name, e.g. `session.status`.
    pub event: String,
    /// Gateway session name. May instead arrive as a query parameter.
    #[serde(default)]
    pub session: Option<String>,
    /// Event body.
    #[serde(default)]
    pub payload: Option<Value>,
    /// Alternate event body field used by some gateway versions.
    #[serde(default)]
    pub data: Option<Value>,
}

impl WebhookPayload {
    fn status(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .or(self.data.as_ref())
            .and_then(|body| body.get("status"))
            .and_then(Value::as_str)
    }
}

/// Result of routing one webhook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Events were delivered to a live transport.
    Delivered(usize),
    /// The webhook carried nothing the worker acts on.
    Ignored,
    /// No live transport owns the session.
    UnknownSession,
}

/// Translate a gateway webhook into transport events.
#[must_use]
pub fn map_webhook(session: &str, webhook: &WebhookPayload) -> Vec<TransportEvent> {
    if webhook.event != "session.status" {
        return Vec::new();
    }
    match webhook.status() {
        Some("WORKING") => vec![
            TransportEvent::CredentialsUpdated(session_handle(session)),
            TransportEvent::Established,
        ],
        Some("SCAN_QR_CODE") => vec![TransportEvent::PairingRequired],
        Some(status @ ("FAILED" | "STOPPED")) => vec![TransportEvent::Closed(
            DisconnectReason::Transient(format!("gateway session {status}")),
        )],
        Some("LOGGED_OUT") => vec![TransportEvent::Closed(DisconnectReason::LoggedOut(
            "gateway session logged out".into(),
        ))],
        _ => Vec::new(),
    }
}

/// The gateway keeps the real network credentials. What is stored locally
/// is the handle needed to resume the gateway session.
fn session_handle(session: &str) -> CredentialBlob {
    CredentialBlob::new(json!({ "gateway": "http", "session": session }).to_string().into_bytes())
}

/// Routes webhooks to the transport currently owning each gateway session.
#[derive(Default)]
pub struct WebhookRouter {
    routes: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
}

impl WebhookRouter {
    /// Empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, session: &str, tx: mpsc::Sender<TransportEvent>) {
        let _ = self.routes.lock().insert(session.to_owned(), tx);
    }

    fn unregister(&self, session: &str) {
        let _ = self.routes.lock().remove(session);
    }

    /// Number of sessions with a live route.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    /// Whether no route is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }

    /// Deliver `webhook`. `session` overrides the body's session field.
    pub fn dispatch(&self, session: Option<&str>, webhook: &WebhookPayload) -> Dispatch {
        let Some(session) = session.or(webhook.session.as_deref()) else {
            return Dispatch::UnknownSession;
        };
        let tx = self.routes.lock().get(session).cloned();
        let Some(tx) = tx else {
            debug!(session, event = %webhook.event, "webhook for unknown session");
            return Dispatch::UnknownSession;
        };
        let events = map_webhook(session, webhook);
        if events.is_empty() {
            return Dispatch::Ignored;
        }
        let mut delivered = 0;
        for event in events {
            if tx.try_send(event).is_ok() {
                delivered += 1;
            } else {
                warn!(session, "webhook event dropped, transport not draining");
            }
        }
        Dispatch::Delivered(delivered)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// [`TransportFactory`] for the HTTP gateway.
pub struct HttpGatewayFactory {
    client: reqwest::Client,
    config: Arc<HttpGatewayConfig>,
    router: Arc<WebhookRouter>,
}

impl HttpGatewayFactory {
    /// Factory sharing one HTTP client and webhook router.
    pub fn new(
        config: HttpGatewayConfig,
        router: Arc<WebhookRouter>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Fatal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config: Arc::new(config),
            router,
        })
    }
}

impl TransportFactory for HttpGatewayFactory {
    fn create(&self, identity: &Identity) -> Box<dyn Transport> {
        Box::new(HttpGatewayTransport {
            session: session_name(identity),
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            events: None,
        })
    }
}

/// One identity's link through the gateway.
pub struct HttpGatewayTransport {
    session: String,
    client: reqwest::Client,
    config: Arc<HttpGatewayConfig>,
    router: Arc<WebhookRouter>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

#[derive(Deserialize)]
struct QrResponse {
    value: String,
}

#[derive(Deserialize)]
struct CodeResponse {
    code: String,
}

impl HttpGatewayTransport {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    async fn send_raw(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        request
            .header(API_KEY_HEADER, &self.config.api_key)
            .send()
            .await
            .map_err(|e| TransportError::Retryable(format!("gateway unreachable: {e}")))
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        check(self.send_raw(request).await?).await
    }

    fn push(&self, event: TransportEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }
}

#[async_trait]
impl Transport for HttpGatewayTransport {
    async fn connect(
        &mut self,
        credential: Option<&CredentialBlob>,
    ) -> Result<TransportEvents, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.router.register(&self.session, tx.clone());
        self.events = Some(tx);

        let mut body = json!({ "name": self.session });
        if let Some(url) = &self.config.webhook_url {
            body["config"] = json!({
                "webhooks": [{ "url": url, "events": ["session.status"] }]
            });
        }
        info!(session = %self.session, resuming = credential.is_some(), "starting gateway session");
        let request = self.client.post(self.url("/api/sessions/start")).json(&body);
        let started = match self.send_raw(request).await {
            // already started counts as started
            Ok(response) if response.status() == StatusCode::CONFLICT => Ok(()),
            Ok(response) => check(response).await.map(drop),
            Err(e) => Err(e),
        };
        match started {
            Ok(()) => Ok(rx),
            Err(e) => {
                self.router.unregister(&self.session);
                self.events = None;
                Err(e)
            }
        }
    }

    async fn send(&mut self, command: TransportCommand) -> Result<(), TransportError> {
        let TransportCommand::RequestPairing(method) = command;
        let material = match method {
            PairingMethod::Qr => {
                let request = self
                    .client
                    .get(self.url(&format!("/api/{}/auth/qr", self.session)))
                    .query(&[("format", "raw")]);
                let qr: QrResponse = self
                    .call(request)
                    .await?
                    .json()
                    .await
                    .map_err(|e| TransportError::Retryable(format!("bad qr response: {e}")))?;
                PairingMaterial::Qr(qr.value)
            }
            PairingMethod::Code { phone } => {
                let request = self
                    .client
                    .post(self.url(&format!("/api/{}/auth/request-code", self.session)))
                    .json(&json!({ "phoneNumber": phone }));
                let code: CodeResponse = self
                    .call(request)
                    .await?
                    .json()
                    .await
                    .map_err(|e| TransportError::Retryable(format!("bad code response: {e}")))?;
                PairingMaterial::Code(code.code)
            }
        };
        debug!(session = %self.session, kind = ?material.kind(), "pairing material received");
        self.push(TransportEvent::PairingMaterial(material));
        Ok(())
    }

    async fn end(&mut self, reason: EndReason) -> Result<(), TransportError> {
        self.router.unregister(&self.session);
        self.events = None;
        let logout = reason == EndReason::Logout;
        let body = json!({ "name": self.session, "logout": logout });
        let request = self.client.post(self.url("/api/sessions/stop")).json(&body);
        let _ = self.call(request).await?;
        info!(session = %self.session, logout, "gateway session stopped");
        Ok(())
    }
}

/// Classify a gateway response: 5xx and 429 may clear up, anything else
/// non-2xx will not.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("gateway returned {}: {}", status.as_u16(), truncate(&body, 200));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(TransportError::Retryable(message))
    } else {
        Err(TransportError::Fatal(message))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(base: &str) -> HttpGatewayConfig {
        HttpGatewayConfig {
            base_url: base.to_owned(),
            api_key: "secret".into(),
            webhook_url: Some("http://tether.local/v1/webhooks/gateway".into()),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn transport(server: &MockServer) -> (Box<dyn Transport>, Arc<WebhookRouter>) {
        let router = Arc::new(WebhookRouter::new());
        let factory = HttpGatewayFactory::new(config(&server.uri()), router.clone()).unwrap();
        (factory.create(&Identity::from("42")), router)
    }

    fn status_hook(status: &str) -> WebhookPayload {
        serde_json::from_value(json!({
            "event": "session.status",
            "session": "operator_42",
            "payload": { "status": status }
        }))
        .unwrap()
    }

    #[test]
    fn session_names() {
        assert_eq!(session_name(&Identity::from("42")), "operator_42");
    }

    #[test]
    fn config_requires_url_and_key() {
        let mut settings = GatewaySettings::default();
        assert!(HttpGatewayConfig::from_settings(&settings).is_err());
        settings.base_url = Some("http://gw:3000/".into());
        settings.api_key = Some("k".into());
        settings.webhook_base_url = Some("http://tether:8090".into());
        let config = HttpGatewayConfig::from_settings(&settings).unwrap();
        assert_eq!(config.base_url, "http://gw:3000");
        assert_eq!(
            config.webhook_url.as_deref(),
            Some("http://tether:8090/v1/webhooks/gateway")
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            map_webhook("operator_42", &status_hook("SCAN_QR_CODE")),
            vec![TransportEvent::PairingRequired]
        );
        assert!(map_webhook("operator_42", &status_hook("STARTING")).is_empty());
        let working = map_webhook("operator_42", &status_hook("WORKING"));
        assert_matches!(working[0], TransportEvent::CredentialsUpdated(_));
        assert_eq!(working[1], TransportEvent::Established);
        assert_matches!(
            map_webhook("operator_42", &status_hook("FAILED"))[0],
            TransportEvent::Closed(DisconnectReason::Transient(_))
        );
        assert_matches!(
            map_webhook("operator_42", &status_hook("LOGGED_OUT"))[0],
            TransportEvent::Closed(DisconnectReason::LoggedOut(_))
        );
    }

    #[test]
    fn legacy_data_field_is_read() {
        let hook: WebhookPayload = serde_json::from_value(json!({
            "event": "session.status",
            "data": { "status": "WORKING" }
        }))
        .unwrap();
        assert_eq!(map_webhook("operator_42", &hook).len(), 2);
    }

    #[tokio::test]
    async fn connect_starts_session_and_routes_webhooks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/start"))
            .and(header("X-Api-Key", "secret"))
            .and(body_partial_json(json!({ "name": "operator_42" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "name": "operator_42" })))
            .expect(1)
            .mount(&server)
            .await;

        let (mut transport, router) = transport(&server);
        let mut events = transport.connect(None).await.unwrap();
        assert_eq!(router.len(), 1);

        assert_eq!(router.dispatch(None, &status_hook("SCAN_QR_CODE")), Dispatch::Delivered(1));
        assert_eq!(events.recv().await, Some(TransportEvent::PairingRequired));
        assert_eq!(router.dispatch(None, &status_hook("STARTING")), Dispatch::Ignored);
        assert_eq!(
            router.dispatch(Some("operator_7"), &status_hook("WORKING")),
            Dispatch::UnknownSession
        );
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/start"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let (mut transport, router) = transport(&server);
        let err = transport.connect(None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn client_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/start"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        let (mut transport, _) = transport(&server);
        let err = transport.connect(None).await.unwrap_err();
        assert_matches!(err, TransportError::Fatal(m) if m.contains("401"));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_retryable() {
        let router = Arc::new(WebhookRouter::new());
        let factory = HttpGatewayFactory::new(config("http://127.0.0.1:1"), router).unwrap();
        let mut transport = factory.create(&Identity::from("42"));
        assert!(transport.connect(None).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn qr_request_emits_material() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/start"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/operator_42/auth/qr"))
            .and(query_param("format", "raw"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": "2@qr" })))
            .mount(&server)
            .await;

        let (mut transport, _) = transport(&server);
        let mut events = transport.connect(None).await.unwrap();
        transport
            .send(TransportCommand::RequestPairing(PairingMethod::Qr))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::PairingMaterial(PairingMaterial::Qr("2@qr".into())))
        );
    }

    #[tokio::test]
    async fn code_request_emits_material() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/start"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/operator_42/auth/request-code"))
            .and(body_partial_json(json!({ "phoneNumber": "15551234567" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": "ABCD-1234" })))
            .mount(&server)
            .await;

        let (mut transport, _) = transport(&server);
        let mut events = transport.connect(None).await.unwrap();
        transport
            .send(TransportCommand::RequestPairing(PairingMethod::Code {
                phone: "15551234567".into(),
            }))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::PairingMaterial(PairingMaterial::Code("ABCD-1234".into())))
        );
    }

    #[tokio::test]
    async fn logout_end_stops_with_logout_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/start"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/stop"))
            .and(body_partial_json(json!({ "name": "operator_42", "logout": true })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (mut transport, router) = transport(&server);
        let _events = transport.connect(None).await.unwrap();
        transport.end(EndReason::Logout).await.unwrap();
        assert!(router.is_empty());
    }
}
