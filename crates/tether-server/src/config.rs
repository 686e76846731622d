//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_settings::TetherSettings;

/// Configuration for the Tether server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent `WebSocket` connections.
    pub max_connections: usize,
    /// Ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a socket after this long without a pong, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
    /// Time allowed for draining at shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 1024 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    /// Derive from loaded settings. The pong timeout is three ping intervals.
    #[must_use]
    pub fn from_settings(settings: &TetherSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            heartbeat_interval_ms: server.heartbeat_interval_ms,
            heartbeat_timeout_ms: server.heartbeat_interval_ms.saturating_mul(3),
            max_message_size: server.max_message_size,
            shutdown_timeout_ms: server.shutdown_timeout_ms,
            ..Self::default()
        }
    }

    /// `host:port` for binding.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ping interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Pong timeout.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Shutdown drain bound.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
