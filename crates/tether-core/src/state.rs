//! Connection states and the legal transition table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one identity's link to the messaging network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link, not trying to establish one.
    Idle,
    /// Transport opening or handshaking.
    Connecting,
    /// Waiting for the operator to scan a QR code or enter a pairing code.
    AwaitingPairing,
    /// Link established.
    Connected,
    /// Link dropped; waiting for the backoff timer before reconnecting.
    Reconnecting,
    /// Network-side or operator logout. Credentials are gone.
    LoggedOut,
    /// Unrecoverable failure (pairing timeout, exhausted retries).
    Error,
}

impl ConnectionState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Idle,
        Self::Connecting,
        Self::AwaitingPairing,
        Self::Connected,
        Self::Reconnecting,
        Self::LoggedOut,
        Self::Error,
    ];

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::LoggedOut => "logged_out",
            Self::Error => "error",
        }
    }

    /// Terminal states require an explicit new `start`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::LoggedOut | Self::Error)
    }

    /// The worker is working towards (or holding) a link.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingPairing | Self::Connected | Self::Reconnecting
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// `AwaitingPairing -> AwaitingPairing` is the one self-loop: fresh
    /// pairing material superseding the previous one.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            AwaitingPairing, Connected, Connecting, Error, Idle, LoggedOut, Reconnecting,
        };
        match (self, next) {
            (Idle, Connecting | LoggedOut)
            | (
                Connecting,
                AwaitingPairing | Connected | Reconnecting | LoggedOut | Error | Idle,
            )
            | (
                AwaitingPairing,
                AwaitingPairing | Connecting | Connected | Reconnecting | LoggedOut | Error | Idle,
            )
            | (Connected, Reconnecting | LoggedOut | Error | Idle)
            | (Reconnecting, Connecting | LoggedOut | Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown connection state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for ConnectionState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_owned()))
    }
}

/// How a `stop` command tears a worker down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Tear down but keep credentials so a later start resumes.
    #[default]
    Pause,
    /// Tear down and delete credentials; next start needs fresh pairing.
    Logout,
}

impl StopMode {
    /// State the worker lands in after this stop.
    #[must_use]
    pub fn target_state(self) -> ConnectionState {
        match self {
            Self::Pause => ConnectionState::Idle,
            Self::Logout => ConnectionState::LoggedOut,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
