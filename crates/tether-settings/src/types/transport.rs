//! Transport selection and HTTP gateway settings.

use serde::{Deserialize, Serialize};

/// Which transport implementation drives the messaging network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process scripted transport (local development and tests).
    #[default]
    Scripted,
    /// External REST gateway with webhook callbacks.
    HttpGateway,
}

/// Transport settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Selected implementation.
    pub kind: TransportKind,
    /// HTTP gateway connection details (required for `http_gateway`).
    pub gateway: GatewaySettings,
}

/// External REST gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Gateway base URL, e.g. `http://localhost:3000`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Value sent as `X-Api-Key`, and expected on inbound webhooks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Public base URL of this server, used to register the webhook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_base_url: Option<String>,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            webhook_base_url: None,
            request_timeout_ms: 10_000,
        }
    }
}
