//! Bounded retry for store writes.

use std::time::Duration;

use tether_core::PersistenceError;
use tether_settings::PersistenceRetrySettings;
use tracing::warn;

/// How many times to try a store write and how long to wait in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistenceRetry {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for PersistenceRetry {
    fn default() -> Self {
        Self::from(&PersistenceRetrySettings::default())
    }
}

impl From<&PersistenceRetrySettings> for PersistenceRetry {
    fn from(settings: &PersistenceRetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            delay: Duration::from_millis(settings.delay_ms),
        }
    }
}

/// Run `op` until it succeeds or attempts run out; returns the last error.
pub(crate) async fn with_retry<T>(
    policy: PersistenceRetry,
    what: &'static str,
    mut op: impl FnMut() -> Result<T, PersistenceError>,
) -> Result<T, PersistenceError> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if attempt < policy.max_attempts => {
                warn!(what, attempt, code = %error.code, error = %error, "store write failed, retrying");
                metrics::counter!(crate::metrics::PERSISTENCE_RETRIES_TOTAL, "op" => what).increment(1);
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
