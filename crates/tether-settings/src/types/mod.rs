//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. `#[serde(default)]` allows partial
//! JSON: missing fields get their default during deserialization.

mod server;
mod session;
mod transport;

pub use server::*;
pub use session::*;
pub use transport::*;

use serde::{Deserialize, Serialize};
use tether_core::BackoffPolicy;

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "auth": { "jwtSecret": "..." },
///   "backoff": { "maxAttempts": 5 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// HTTP/WebSocket server.
    pub server: ServerSettings,
    /// SQLite database.
    pub database: DatabaseSettings,
    /// Bearer token verification.
    pub auth: AuthSettings,
    /// Connection worker behavior.
    pub worker: WorkerSettings,
    /// Reconnect schedule.
    pub backoff: BackoffPolicy,
    /// Retry policy for credential and projection writes.
    pub persistence: PersistenceRetrySettings,
    /// Status publisher.
    pub publisher: PublisherSettings,
    /// Which transport drives the messaging network.
    pub transport: TransportSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "tether".to_string(),
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            auth: AuthSettings::default(),
            worker: WorkerSettings::default(),
            backoff: BackoffPolicy::default(),
            persistence: PersistenceRetrySettings::default(),
            publisher: PublisherSettings::default(),
            transport: TransportSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
