//! Status publisher: projection upkeep and live fan-out.
//!
//! Every [`StatusEvent`] a worker emits goes through [`StatusPublisher::publish`]:
//!
//! 1. Pairing material is rendered into a displayable [`PairingPayload`]
//!    (QR as an image data URL, codes as-is).
//! 2. The resulting [`StatusUpdate`] is folded into the identity's
//!    [`StatusProjection`], which is written to the [`ProjectionStore`] with
//!    bounded retry.
//! 3. The update is offered to each live subscriber of that identity. Slow
//!    subscribers lose updates instead of stalling the worker; closed ones
//!    are pruned.
//!
//! Locks guard only map mutation. Store calls and channel sends never
//! happen while a lock is held across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::{
    ConnectionState, Identity, PersistenceError, ProjectionStore, StatusEvent, StatusPayload,
    StatusProjection, StatusUpdate, SubscriberId, UpdatePayload,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::metrics::{
    SUBSCRIBERS_ACTIVE, UPDATES_DROPPED_TOTAL, UPDATES_PUBLISHED_TOTAL,
};
use crate::pairing::render_pairing;
use crate::retry::{PersistenceRetry, with_retry};

/// Where workers deliver their events.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Deliver one event. Returns once the projection reflects it.
    async fn emit(&self, event: StatusEvent);
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscribers
// ─────────────────────────────────────────────────────────────────────────────

/// Publisher-side entry for one subscriber.
struct SubscriberSlot {
    id: SubscriberId,
    tx: mpsc::Sender<StatusUpdate>,
    dropped: AtomicU64,
}

impl SubscriberSlot {
    /// Offer an update without waiting. Returns `false` if the buffer is full
    /// or the receiver is gone.
    fn offer(&self, update: &StatusUpdate) -> bool {
        match self.tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!(UPDATES_DROPPED_TOTAL).increment(1);
                warn!(subscriber = %self.id, dropped, "subscriber buffer full, update dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Live update stream for one identity.
pub struct Subscriber {
    id: SubscriberId,
    identity: Identity,
    rx: mpsc::Receiver<StatusUpdate>,
}

impl Subscriber {
    /// Subscriber ID, for [`StatusPublisher::unsubscribe`].
    #[must_use]
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Identity this subscriber follows.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Next update, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<StatusUpdate> {
        self.rx.recv().await
    }

    /// Next update if one is already buffered.
    pub fn try_recv(&mut self) -> Option<StatusUpdate> {
        self.rx.try_recv().ok()
    }

    /// Consume into a stream of updates.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<StatusUpdate> {
        ReceiverStream::new(self.rx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// Maintains status projections and fans updates out to subscribers.
pub struct StatusPublisher {
    projections: Arc<dyn ProjectionStore>,
    latest: Mutex<HashMap<Identity, StatusProjection>>,
    subscribers: Mutex<HashMap<Identity, Vec<SubscriberSlot>>>,
    buffer: usize,
    retry: PersistenceRetry,
}

impl StatusPublisher {
    /// Publisher writing projections to `projections`. Each subscriber gets a
    /// buffer of `buffer` updates.
    pub fn new(
        projections: Arc<dyn ProjectionStore>,
        buffer: usize,
        retry: PersistenceRetry,
    ) -> Self {
        Self {
            projections,
            latest: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            retry,
        }
    }

    /// Render, fold, persist, and fan out one event. Returns the update as
    /// subscribers saw it.
    pub async fn publish(&self, event: StatusEvent) -> StatusUpdate {
        let update = to_update(event);
        let identity = update.identity.clone();

        let previous = self.cached_or_loaded(&identity);
        let next = previous.apply(&update);
        let _ = self.latest.lock().insert(identity.clone(), next.clone());

        let store = Arc::clone(&self.projections);
        match with_retry(self.retry, "projection.save", || store.save(&next)).await {
            Ok(stored) => {
                let mut latest = self.latest.lock();
                if latest.get(&identity).is_some_and(|p| p.updated_at <= stored.updated_at) {
                    let _ = latest.insert(identity.clone(), stored);
                }
            }
            Err(e) => {
                error!(identity = %identity, code = %e.code, error = %e, "failed to persist status projection");
            }
        }

        let delivered = self.fan_out(&update);
        metrics::counter!(UPDATES_PUBLISHED_TOTAL, "kind" => kind_label(&update)).increment(1);
        debug!(
            identity = %identity,
            state = %update.payload.state,
            delivered,
            "status published"
        );
        update
    }

    fn cached_or_loaded(&self, identity: &Identity) -> StatusProjection {
        if let Some(cached) = self.latest.lock().get(identity) {
            return cached.clone();
        }
        match self.projections.load(identity) {
            Ok(Some(stored)) => stored,
            Ok(None) => StatusProjection::initial(identity.clone()),
            Err(e) => {
                warn!(identity = %identity, error = %e, "projection load failed, folding from initial");
                StatusProjection::initial(identity.clone())
            }
        }
    }

    fn fan_out(&self, update: &StatusUpdate) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(slots) = subscribers.get_mut(&update.identity) else {
            return 0;
        };
        let delivered = slots.iter().filter(|slot| slot.offer(update)).count();
        let before = slots.len();
        slots.retain(|slot| !slot.tx.is_closed());
        let pruned = before - slots.len();
        if slots.is_empty() {
            let _ = subscribers.remove(&update.identity);
        }
        if pruned > 0 {
            debug!(identity = %update.identity, pruned, "pruned closed subscribers");
            metrics::gauge!(SUBSCRIBERS_ACTIVE).decrement(count_f64(pruned));
        }
        delivered
    }

    /// Register a live subscriber for `identity`.
    pub fn subscribe(&self, identity: &Identity) -> Subscriber {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = SubscriberId::new();
        self.subscribers
            .lock()
            .entry(identity.clone())
            .or_default()
            .push(SubscriberSlot {
                id: id.clone(),
                tx,
                dropped: AtomicU64::new(0),
            });
        metrics::gauge!(SUBSCRIBERS_ACTIVE).increment(1.0);
        debug!(identity = %identity, subscriber = %id, "subscriber added");
        Subscriber {
            id,
            identity: identity.clone(),
            rx,
        }
    }

    /// Remove a subscriber. Its stream ends once buffered updates drain.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let mut removed = false;
        subscribers.retain(|_, slots| {
            let before = slots.len();
            slots.retain(|slot| slot.id != *id);
            removed |= slots.len() != before;
            !slots.is_empty()
        });
        if removed {
            metrics::gauge!(SUBSCRIBERS_ACTIVE).decrement(1.0);
            debug!(subscriber = %id, "subscriber removed");
        }
        removed
    }

    /// Publish `idle` for every stored projection still claiming an active
    /// state. Run once at startup, before any worker exists, so no projection
    /// outlives the process that owned its worker. Returns the identities
    /// that were reset.
    pub async fn reset_stale(&self, note: &str) -> Result<Vec<Identity>, PersistenceError> {
        let stale: Vec<Identity> = self
            .projections
            .list()?
            .into_iter()
            .filter(|p| p.state.is_active())
            .map(|p| p.identity)
            .collect();
        for identity in &stale {
            let _ = self
                .publish(StatusEvent::status(
                    identity.clone(),
                    ConnectionState::Idle,
                    Some(note.to_owned()),
                ))
                .await;
        }
        if !stale.is_empty() {
            warn!(count = stale.len(), note, "reset stale active projections");
        }
        Ok(stale)
    }

    /// Live subscribers for `identity`.
    #[must_use]
    pub fn subscriber_count(&self, identity: &Identity) -> usize {
        self.subscribers.lock().get(identity).map_or(0, Vec::len)
    }

    /// Current projection for `identity`. Identities nothing was ever
    /// published for read as `idle`.
    pub fn current_status(&self, identity: &Identity) -> Result<StatusProjection, PersistenceError> {
        if let Some(cached) = self.latest.lock().get(identity) {
            return Ok(cached.clone());
        }
        Ok(self
            .projections
            .load(identity)?
            .unwrap_or_else(|| StatusProjection::initial(identity.clone())))
    }
}

#[async_trait]
impl StatusSink for StatusPublisher {
    async fn emit(&self, event: StatusEvent) {
        let _ = self.publish(event).await;
    }
}

fn to_update(event: StatusEvent) -> StatusUpdate {
    let kind = event.kind();
    let state = event.state;
    let payload = match event.payload {
        StatusPayload::Status { message } => UpdatePayload {
            state,
            pairing: None,
            message,
            cause: None,
        },
        StatusPayload::Pairing(material) => UpdatePayload {
            state,
            pairing: Some(render_pairing(&material)),
            message: None,
            cause: None,
        },
        StatusPayload::CredentialUpdate => UpdatePayload {
            state,
            pairing: None,
            message: None,
            cause: None,
        },
        StatusPayload::Error { cause, message } => UpdatePayload {
            state,
            pairing: None,
            message: Some(message),
            cause: Some(cause),
        },
    };
    StatusUpdate {
        identity: event.identity,
        kind,
        payload,
        timestamp: event.timestamp,
    }
}

fn kind_label(update: &StatusUpdate) -> &'static str {
    match update.kind {
        tether_core::StatusEventKind::Status => "status",
        tether_core::StatusEventKind::Pairing => "pairing",
        tether_core::StatusEventKind::CredentialUpdate => "credential_update",
        tether_core::StatusEventKind::Error => "error",
    }
}

#[allow(clippy::cast_precision_loss)]
fn count_f64(n: usize) -> f64 {
    n as f64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
