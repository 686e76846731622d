//! Status events, pairing material, and the status projection.
//!
//! A [`StatusEvent`] is what a connection worker emits on every transition.
//! It may carry raw [`PairingMaterial`], so it never leaves the process. The
//! publisher turns it into a [`StatusUpdate`] (displayable, serializable) and
//! folds that into the identity's [`StatusProjection`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorCause;
use crate::ids::Identity;
use crate::state::ConnectionState;

// ─────────────────────────────────────────────────────────────────────────────
// Pairing
// ─────────────────────────────────────────────────────────────────────────────

/// How an identity pairs a new device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PairingMethod {
    /// Display a QR code for the operator to scan.
    #[default]
    Qr,
    /// Request an alphanumeric code linked to a phone number.
    Code {
        /// Phone number in international format, digits only.
        phone: String,
    },
}

/// Which kind of pairing material is on display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingKind {
    /// A QR image.
    Qr,
    /// An alphanumeric code.
    Code,
}

/// Raw pairing secret as delivered by the transport.
///
/// `Debug` is redacted. The raw value is only reachable through
/// [`PairingMaterial::expose`].
#[derive(Clone, PartialEq, Eq)]
pub enum PairingMaterial {
    /// Raw QR contents (not yet an image).
    Qr(String),
    /// Alphanumeric pairing code.
    Code(String),
}

impl PairingMaterial {
    /// Material kind.
    #[must_use]
    pub fn kind(&self) -> PairingKind {
        match self {
            Self::Qr(_) => PairingKind::Qr,
            Self::Code(_) => PairingKind::Code,
        }
    }

    /// The raw secret. Never log this.
    #[must_use]
    pub fn expose(&self) -> &str {
        match self {
            Self::Qr(raw) | Self::Code(raw) => raw,
        }
    }
}

impl fmt::Debug for PairingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairingMaterial::{:?}(<{} bytes>)", self.kind(), self.expose().len())
    }
}

/// Displayable pairing payload: a `data:` image URL for QR, the code as-is
/// for code pairing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    /// Material kind.
    pub kind: PairingKind,
    /// Image data URL or pairing code.
    pub value: String,
}

impl fmt::Debug for PairingPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingPayload")
            .field("kind", &self.kind)
            .field("value", &format_args!("<{} bytes>", self.value.len()))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StatusEvent (worker -> publisher)
// ─────────────────────────────────────────────────────────────────────────────

/// Event kind on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventKind {
    /// State changed.
    Status,
    /// New pairing material superseding the previous one.
    Pairing,
    /// Credentials were persisted.
    CredentialUpdate,
    /// Failure report.
    Error,
}

/// What a status event carries besides the state.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusPayload {
    /// Plain state change.
    Status {
        /// Optional human-readable note.
        message: Option<String>,
    },
    /// Raw pairing material.
    Pairing(PairingMaterial),
    /// Credentials were written.
    CredentialUpdate,
    /// Failure.
    Error {
        /// Classification.
        cause: ErrorCause,
        /// Human-readable description.
        message: String,
    },
}

/// One event emitted by a connection worker.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusEvent {
    /// Identity the event belongs to.
    pub identity: Identity,
    /// Worker state after the event.
    pub state: ConnectionState,
    /// Event body.
    pub payload: StatusPayload,
    /// When the worker produced the event.
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    fn at(identity: Identity, state: ConnectionState, payload: StatusPayload) -> Self {
        Self {
            identity,
            state,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Plain state change.
    #[must_use]
    pub fn status(identity: Identity, state: ConnectionState, message: Option<String>) -> Self {
        Self::at(identity, state, StatusPayload::Status { message })
    }

    /// New pairing material.
    #[must_use]
    pub fn pairing(identity: Identity, material: PairingMaterial) -> Self {
        Self::at(
            identity,
            ConnectionState::AwaitingPairing,
            StatusPayload::Pairing(material),
        )
    }

    /// Credentials persisted while in `state`.
    #[must_use]
    pub fn credential_update(identity: Identity, state: ConnectionState) -> Self {
        Self::at(identity, state, StatusPayload::CredentialUpdate)
    }

    /// Failure report.
    #[must_use]
    pub fn error(
        identity: Identity,
        state: ConnectionState,
        cause: ErrorCause,
        message: impl Into<String>,
    ) -> Self {
        Self::at(
            identity,
            state,
            StatusPayload::Error {
                cause,
                message: message.into(),
            },
        )
    }

    /// Event kind.
    #[must_use]
    pub fn kind(&self) -> StatusEventKind {
        match self.payload {
            StatusPayload::Status { .. } => StatusEventKind::Status,
            StatusPayload::Pairing(_) => StatusEventKind::Pairing,
            StatusPayload::CredentialUpdate => StatusEventKind::CredentialUpdate,
            StatusPayload::Error { .. } => StatusEventKind::Error,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StatusUpdate (publisher -> subscribers)
// ─────────────────────────────────────────────────────────────────────────────

/// Body of a published update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// State after the event.
    pub state: ConnectionState,
    /// Displayable pairing payload (pairing events only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing: Option<PairingPayload>,
    /// Status note or error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error classification (error events only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ErrorCause>,
}

/// A published status update as subscribers see it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Identity the update belongs to.
    pub identity: Identity,
    /// Event kind.
    pub kind: StatusEventKind,
    /// Event body.
    pub payload: UpdatePayload,
    /// When the worker produced the event.
    pub timestamp: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// StatusProjection
// ─────────────────────────────────────────────────────────────────────────────

/// Last-write-wins snapshot of one identity, read by polling clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusProjection {
    /// Identity.
    pub identity: Identity,
    /// Current state.
    pub state: ConnectionState,
    /// Latest pairing payload while awaiting pairing.
    #[serde(default)]
    pub pairing_payload: Option<PairingPayload>,
    /// Latest error description, if the last report was a failure.
    #[serde(default)]
    pub error: Option<String>,
    /// Time of the last applied update. `None` if nothing was ever published.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusProjection {
    /// Projection of an identity nothing was ever published for.
    #[must_use]
    pub fn initial(identity: Identity) -> Self {
        Self {
            identity,
            state: ConnectionState::Idle,
            pairing_payload: None,
            error: None,
            updated_at: None,
        }
    }

    /// Fold an update into the projection.
    ///
    /// Pairing payloads survive only while the state stays
    /// `AwaitingPairing`; a newer pairing update always replaces the older
    /// one. `updated_at` never moves backwards.
    #[must_use]
    pub fn apply(&self, update: &StatusUpdate) -> Self {
        let state = update.payload.state;
        let pairing_payload = match (&update.payload.pairing, state) {
            (Some(fresh), _) => Some(fresh.clone()),
            (None, ConnectionState::AwaitingPairing) => self.pairing_payload.clone(),
            (None, _) => None,
        };
        let error = match update.kind {
            StatusEventKind::Error => update.payload.message.clone(),
            StatusEventKind::CredentialUpdate => self.error.clone(),
            StatusEventKind::Status | StatusEventKind::Pairing => {
                if state.is_terminal() {
                    self.error.clone()
                } else {
                    None
                }
            }
        };
        let updated_at = match self.updated_at {
            Some(prev) if prev > update.timestamp => Some(prev),
            _ => Some(update.timestamp),
        };
        Self {
            identity: self.identity.clone(),
            state,
            pairing_payload,
            error,
            updated_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
