//! Transport capability interface.
//!
//! A [`Transport`] is the worker's only view of the messaging network: it
//! opens a link (optionally resuming with stored credentials), reports what
//! the network says through an event channel, accepts pairing requests, and
//! closes the link on request. Each worker owns exactly one transport
//! instance, created by a [`TransportFactory`].

pub mod http_gateway;
pub mod scripted;

use async_trait::async_trait;
use tether_core::{CredentialBlob, ErrorCause, Identity, PairingMaterial, PairingMethod};
use tokio::sync::mpsc;

/// Stream of network-side events for one open link.
///
/// The sender side is owned by the transport; the channel closing is
/// equivalent to a transient [`TransportEvent::Closed`].
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Why the network closed the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Connection lost; a reconnect may succeed.
    Transient(String),
    /// The network revoked the session. Stored credentials are now useless.
    LoggedOut(String),
}

/// Something the network reported.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// No usable credentials; the network wants the operator to pair.
    PairingRequired,
    /// Fresh pairing material to show the operator. Supersedes any earlier one.
    PairingMaterial(PairingMaterial),
    /// The operator completed pairing; the link is finishing its handshake.
    Paired,
    /// The network issued or rotated credentials.
    CredentialsUpdated(CredentialBlob),
    /// The link is fully usable.
    Established,
    /// The link closed.
    Closed(DisconnectReason),
}

/// Requests a worker sends to an open link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCommand {
    /// Ask for pairing material using the given method.
    RequestPairing(PairingMethod),
}

/// Why the worker is closing the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// Operator paused; the network session stays valid for later resumption.
    Pause,
    /// Operator logged out; the network session should be revoked.
    Logout,
    /// The worker reached a terminal state on its own.
    Failed,
}

/// Transport failures surfaced to the worker.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Temporary condition: network error, upstream 5xx, timeout.
    #[error("transport unavailable: {0}")]
    Retryable(String),
    /// Permanent condition: rejected credentials, bad request, misconfiguration.
    #[error("transport refused: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether a reconnect may help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Failure category for status events.
    #[must_use]
    pub fn cause(&self) -> ErrorCause {
        match self {
            Self::Retryable(_) => ErrorCause::TransportRetryable,
            Self::Fatal(_) => ErrorCause::TransportFatal,
        }
    }
}

/// The link a worker drives.
#[async_trait]
pub trait Transport: Send {
    /// Open the link. `credential` is the stored blob when one exists; the
    /// transport should try to resume with it before asking for pairing.
    async fn connect(
        &mut self,
        credential: Option<&CredentialBlob>,
    ) -> Result<TransportEvents, TransportError>;

    /// Send a request over the open link.
    async fn send(&mut self, command: TransportCommand) -> Result<(), TransportError>;

    /// Close the link.
    async fn end(&mut self, reason: EndReason) -> Result<(), TransportError>;
}

/// Builds one transport per worker.
pub trait TransportFactory: Send + Sync {
    /// New, unconnected transport for `identity`.
    fn create(&self, identity: &Identity) -> Box<dyn Transport>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
