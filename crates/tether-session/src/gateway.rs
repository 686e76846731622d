//! Command gateway: the authorized entry point for start, stop, status,
//! and subscribe.
//!
//! The gateway never drives a link itself. It authorizes the caller, finds
//! or creates the identity's worker through the registry, hands it a
//! command, and answers from the status projection. Callers learn the real
//! outcome of a start or stop from the published status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{
    ConnectionState, CredentialStore, ErrorCause, Identity, PairingPayload, PersistenceError,
    StatusEvent, StatusProjection, StopMode,
};
use tether_settings::TetherSettings;
use tracing::{debug, info, warn};

use crate::auth::{Authorizer, Caller, Resolution};
use crate::publisher::{StatusPublisher, Subscriber};
use crate::registry::{FORCED_STOP_NOTE, SessionRegistry};
use crate::retry::{PersistenceRetry, with_retry};
use crate::worker::StopOutcome;

/// Extra time a stop waits beyond the worker's own teardown bound.
const STOP_ACK_MARGIN: Duration = Duration::from_secs(1);

/// Gateway failures.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The service is missing configuration it needs.
    #[error("server configuration error: {0}")]
    Configuration(String),
    /// The caller may not act on this identity.
    #[error("not authorized for identity {0}")]
    Unauthorized(Identity),
    /// The caller has no identity granted.
    #[error("no identity granted to caller")]
    NoIdentity,
    /// The caller has several identities and named none.
    #[error("identity required: caller has {0} granted identities")]
    AmbiguousIdentity(usize),
    /// The identity string is malformed.
    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),
    /// A store operation failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl GatewayError {
    /// Failure category.
    #[must_use]
    pub fn cause(&self) -> Option<ErrorCause> {
        match self {
            Self::Configuration(_) => Some(ErrorCause::Configuration),
            Self::Unauthorized(_) | Self::NoIdentity => Some(ErrorCause::Authorization),
            Self::Persistence(_) => Some(ErrorCause::Persistence),
            Self::AmbiguousIdentity(_) | Self::InvalidIdentity(_) => None,
        }
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Unauthorized(_) | Self::NoIdentity => "AUTHORIZATION_ERROR",
            Self::AmbiguousIdentity(_) => "IDENTITY_REQUIRED",
            Self::InvalidIdentity(_) => "INVALID_IDENTITY",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

/// Gateway timing.
#[derive(Clone, Copy, Debug)]
pub struct GatewayConfig {
    /// How long `start` waits for the worker to leave `idle` before answering.
    pub start_wait: Duration,
    /// Teardown bound handed to stopping workers.
    pub teardown_grace: Duration,
    /// Store write retry for gateway-side credential deletes.
    pub persistence: PersistenceRetry,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_settings(&TetherSettings::default())
    }
}

impl GatewayConfig {
    /// Build from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &TetherSettings) -> Self {
        Self {
            start_wait: Duration::from_millis(settings.worker.start_wait_ms),
            teardown_grace: Duration::from_millis(settings.worker.teardown_grace_ms),
            persistence: PersistenceRetry::from(&settings.persistence),
        }
    }
}

/// Reply to `start` and `status`: the identity's projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Identity.
    pub identity: Identity,
    /// Current state.
    pub state: ConnectionState,
    /// Pairing payload while awaiting pairing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_payload: Option<PairingPayload>,
    /// Last error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time of the last published update.
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<StatusProjection> for StatusResponse {
    fn from(p: StatusProjection) -> Self {
        Self {
            identity: p.identity,
            state: p.state,
            pairing_payload: p.pairing_payload,
            error: p.error,
            updated_at: p.updated_at,
        }
    }
}

/// Reply to `stop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    /// Always `true` once the stop was accepted.
    pub ok: bool,
}

/// Authorized entry point for session commands.
pub struct CommandGateway {
    registry: Arc<SessionRegistry>,
    publisher: Arc<StatusPublisher>,
    credentials: Arc<dyn CredentialStore>,
    authorizer: Arc<dyn Authorizer>,
    config: GatewayConfig,
}

impl CommandGateway {
    /// Wire a gateway.
    pub fn new(
        registry: Arc<SessionRegistry>,
        publisher: Arc<StatusPublisher>,
        credentials: Arc<dyn CredentialStore>,
        authorizer: Arc<dyn Authorizer>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            publisher,
            credentials,
            authorizer,
            config,
        }
    }

    /// The registry this gateway drives.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The publisher this gateway reads.
    #[must_use]
    pub fn publisher(&self) -> &Arc<StatusPublisher> {
        &self.publisher
    }

    /// Check `caller` against `identity`, or pick the caller's only
    /// identity when none is named.
    pub fn authorize(
        &self,
        caller: &Caller,
        identity: Option<&Identity>,
    ) -> Result<Identity, GatewayError> {
        let Some(identity) = identity else {
            return match self.authorizer.resolve(caller)? {
                Resolution::Single(identity) => Ok(identity),
                Resolution::None => Err(GatewayError::NoIdentity),
                Resolution::Ambiguous(n) => Err(GatewayError::AmbiguousIdentity(n)),
            };
        };
        if !identity.is_valid() {
            return Err(GatewayError::InvalidIdentity(identity.to_string()));
        }
        if self.authorizer.authorize(caller, identity)? {
            Ok(identity.clone())
        } else {
            warn!(user = %caller.user_id, identity = %identity, "unauthorized session command");
            Err(GatewayError::Unauthorized(identity.clone()))
        }
    }

    /// Ensure a worker exists for the identity and ask it to connect.
    ///
    /// Starting an identity that is already active is a no-op that echoes
    /// its current status.
    pub async fn start(
        &self,
        caller: &Caller,
        identity: Option<&Identity>,
    ) -> Result<StatusResponse, GatewayError> {
        let identity = self.authorize(caller, identity)?;

        let mut handle = self.registry.acquire(&identity);
        if handle.state().is_terminal() {
            // a worker that just failed is still tearing down
            let _ = handle.wait_finished(self.config.teardown_grace).await;
            let _ = self.registry.release(&identity, handle.id());
            handle = self.registry.acquire(&identity);
        }

        if handle.state() == ConnectionState::Idle {
            info!(user = %caller.user_id, identity = %identity, "session start");
            if handle.start().await {
                let _ = handle
                    .wait_for_change(ConnectionState::Idle, self.config.start_wait)
                    .await;
            }
        } else {
            debug!(identity = %identity, state = %handle.state(), "start on active session is a no-op");
        }
        Ok(self.publisher.current_status(&identity)?.into())
    }

    /// Stop the identity's worker.
    ///
    /// `Pause` keeps credentials for later resumption; `Logout` deletes them.
    /// Stopping an identity with no worker is a no-op for `Pause`; for
    /// `Logout` it still clears stored credentials.
    pub async fn stop(
        &self,
        caller: &Caller,
        identity: Option<&Identity>,
        mode: StopMode,
    ) -> Result<StopResponse, GatewayError> {
        let identity = self.authorize(caller, identity)?;
        info!(user = %caller.user_id, identity = %identity, ?mode, "session stop");

        let outcome = match self.registry.get(&identity) {
            Some(handle) => {
                let outcome = handle
                    .stop(mode, self.config.teardown_grace + STOP_ACK_MARGIN)
                    .await;
                let _ = self.registry.release(&identity, handle.id());
                outcome
            }
            None => StopOutcome::AlreadyGone,
        };

        match (mode, outcome) {
            (_, StopOutcome::Graceful) | (StopMode::Pause, StopOutcome::AlreadyGone) => {}
            (StopMode::Pause, StopOutcome::Forced) => {
                let _ = self
                    .publisher
                    .publish(StatusEvent::status(
                        identity,
                        ConnectionState::Idle,
                        Some(FORCED_STOP_NOTE.into()),
                    ))
                    .await;
            }
            (StopMode::Logout, StopOutcome::AlreadyGone | StopOutcome::Forced) => {
                let store = Arc::clone(&self.credentials);
                let existed = with_retry(self.config.persistence, "credentials.delete", || {
                    store.delete(&identity)
                })
                .await?;
                debug!(identity = %identity, existed, "credentials cleared without a live worker");
                let _ = self
                    .publisher
                    .publish(StatusEvent::status(
                        identity,
                        ConnectionState::LoggedOut,
                        Some("logged out".into()),
                    ))
                    .await;
            }
        }
        Ok(StopResponse { ok: true })
    }

    /// Current projection for the identity.
    pub fn status(
        &self,
        caller: &Caller,
        identity: Option<&Identity>,
    ) -> Result<StatusResponse, GatewayError> {
        let identity = self.authorize(caller, identity)?;
        Ok(self.publisher.current_status(&identity)?.into())
    }

    /// Live updates for the identity, plus the projection at subscribe time.
    pub fn subscribe(
        &self,
        caller: &Caller,
        identity: Option<&Identity>,
    ) -> Result<(StatusProjection, Subscriber), GatewayError> {
        let identity = self.authorize(caller, identity)?;
        let subscriber = self.publisher.subscribe(&identity);
        let snapshot = self.publisher.current_status(&identity)?;
        Ok((snapshot, subscriber))
    }

    /// Drop a subscription.
    pub fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        self.publisher.unsubscribe(subscriber.id())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
