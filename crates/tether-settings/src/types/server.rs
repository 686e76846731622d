//! Server, database, auth, and logging settings.

use serde::{Deserialize, Serialize};

/// HTTP/WebSocket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks a free port).
    pub port: u16,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Maximum inbound WebSocket frame size in bytes.
    pub max_message_size: usize,
    /// Grace period for draining connections at shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            heartbeat_interval_ms: 30_000,
            max_message_size: 1024 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// SQLite database settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database file. Relative paths resolve against `~/.tether`.
    pub path: String,
    /// Connection pool size.
    pub pool_size: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "tether.db".to_string(),
            pool_size: 4,
        }
    }
}

/// Bearer token verification settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret shared with the token issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_secs: u64,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
