//! Error taxonomy shared across crates.
//!
//! - [`ErrorCause`]: why a worker reported an `error` event or a command was
//!   rejected. Serialized into status updates.
//! - [`PersistenceError`]: storage failure with table and operation context.
//!   Returned by every store trait.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// ErrorCause
// ─────────────────────────────────────────────────────────────────────────────

/// Classification of a failure visible to status consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// Required setup is missing. Commands fail before any worker action.
    Configuration,
    /// Caller is not permitted to act on the identity.
    Authorization,
    /// No successful pairing inside the pairing window.
    PairingTimeout,
    /// Network drop or transient disconnect.
    TransportRetryable,
    /// The network refused the session for good.
    TransportFatal,
    /// Reconnect attempts ran past the configured cap.
    ReconnectExhausted,
    /// Credential or projection write failed.
    Persistence,
}

impl ErrorCause {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Authorization => "AUTHORIZATION_ERROR",
            Self::PairingTimeout => "PAIRING_TIMEOUT",
            Self::TransportRetryable => "TRANSPORT_RETRYABLE",
            Self::TransportFatal => "TRANSPORT_FATAL",
            Self::ReconnectExhausted => "RECONNECT_EXHAUSTED",
            Self::Persistence => "PERSISTENCE_ERROR",
        }
    }

    /// Whether the worker retries on its own after this cause.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransportRetryable | Self::Persistence)
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PersistenceError
// ─────────────────────────────────────────────────────────────────────────────

/// Storage operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceOperation {
    /// Reading from the store.
    Read,
    /// Writing to the store.
    Write,
    /// Deleting from the store.
    Delete,
}

impl fmt::Display for PersistenceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Storage failure.
#[derive(Debug, Error)]
#[error("Persistence {operation} failed on {table}: {message}")]
pub struct PersistenceError {
    /// Table or store that failed.
    pub table: String,
    /// Operation that failed.
    pub operation: PersistenceOperation,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable error code.
    pub code: String,
    /// Original cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PersistenceError {
    /// Create a new persistence error.
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        operation: PersistenceOperation,
        message: impl Into<String>,
    ) -> Self {
        let op_upper = operation.to_string().to_uppercase();
        Self {
            table: table.into(),
            operation,
            message: message.into(),
            code: format!("PERSISTENCE_{op_upper}_ERROR"),
            source: None,
        }
    }

    /// Set the error cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
