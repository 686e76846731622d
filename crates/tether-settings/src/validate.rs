//! Consistency checks run once before startup.

use crate::errors::{Result, SettingsError};
use crate::types::{TetherSettings, TransportKind};

impl TetherSettings {
    /// Reject settings the session manager cannot run with.
    ///
    /// The JWT secret is checked separately through
    /// [`crate::AuthSettings::secret`] so a server without one still serves
    /// health and metrics while rejecting commands.
    pub fn validate(&self) -> Result<()> {
        let backoff = &self.backoff;
        if backoff.multiplier < 1.0 {
            return Err(invalid("backoff.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            return Err(invalid("backoff.jitterFactor must be within 0.0..=1.0"));
        }
        if backoff.base_delay_ms == 0 || backoff.base_delay_ms > backoff.max_delay_ms {
            return Err(invalid(
                "backoff.baseDelayMs must be positive and <= backoff.maxDelayMs",
            ));
        }
        if self.worker.pairing_timeout_ms == 0 {
            return Err(invalid("worker.pairingTimeoutMs must be positive"));
        }
        if self.worker.pairing_refresh_ms == 0 {
            return Err(invalid("worker.pairingRefreshMs must be positive"));
        }
        if self.worker.teardown_grace_ms == 0 {
            return Err(invalid("worker.teardownGraceMs must be positive"));
        }
        if self.worker.command_buffer == 0 || self.publisher.subscriber_buffer == 0 {
            return Err(invalid("channel capacities must be positive"));
        }
        if self.persistence.max_attempts == 0 {
            return Err(invalid("persistence.maxAttempts must be at least 1"));
        }
        if let tether_core::PairingMethod::Code { phone } = &self.worker.pairing {
            if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid("worker.pairing.phone must be digits only"));
            }
        }
        if self.transport.kind == TransportKind::HttpGateway {
            let gateway = &self.transport.gateway;
            if gateway.base_url.as_deref().is_none_or(str::is_empty) {
                return Err(invalid("transport.gateway.baseUrl is required for http_gateway"));
            }
            if gateway.api_key.as_deref().is_none_or(str::is_empty) {
                return Err(invalid("transport.gateway.apiKey is required for http_gateway"));
            }
        }
        Ok(())
    }
}

impl crate::AuthSettings {
    /// The configured JWT secret, or a configuration error.
    pub fn secret(&self) -> Result<&str> {
        self.jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("auth.jwtSecret is required"))
    }
}

fn invalid(message: &str) -> SettingsError {
    SettingsError::InvalidValue(message.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
