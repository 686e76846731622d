//! Connection worker, persistence retry, and publisher settings.

use serde::{Deserialize, Serialize};
use tether_core::PairingMethod;

/// Connection worker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    /// How long a worker waits for pairing before giving up, in milliseconds.
    pub pairing_timeout_ms: u64,
    /// How often a QR is requested again while pairing, in milliseconds.
    pub pairing_refresh_ms: u64,
    /// Bound on transport teardown during stop, in milliseconds.
    pub teardown_grace_ms: u64,
    /// How long `start` waits for the worker to leave `idle`, in milliseconds.
    pub start_wait_ms: u64,
    /// QR (default) or phone-number code pairing.
    pub pairing: PairingMethod,
    /// Worker command channel capacity.
    pub command_buffer: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pairing_timeout_ms: 120_000,
            pairing_refresh_ms: 5_000,
            teardown_grace_ms: 5_000,
            start_wait_ms: 1_000,
            pairing: PairingMethod::Qr,
            command_buffer: 16,
        }
    }
}

/// Bounded retry for credential and projection writes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceRetrySettings {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds.
    pub delay_ms: u64,
}

impl Default for PersistenceRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 200,
        }
    }
}

/// Status publisher settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherSettings {
    /// Per-subscriber queue length. A full queue drops updates for that
    /// subscriber only.
    pub subscriber_buffer: usize,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
        }
    }
}
