//! Session registry: identity → live worker.
//!
//! The only place workers are created. Lookup, creation, and insertion
//! happen under one lock, so concurrent `acquire` calls for the same
//! identity always agree on a single worker. Distinct identities never
//! wait on each other beyond that short critical section.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tether_core::{ConnectionState, CredentialStore, Identity, StatusEvent, StopMode, WorkerId};
use tracing::{debug, info};

use crate::metrics::{WORKERS_ACTIVE, WORKERS_SPAWNED_TOTAL};
use crate::publisher::StatusSink;
use crate::transport::TransportFactory;
use crate::worker::{self, StopOutcome, WorkerContext, WorkerHandle, WorkerPolicy};

/// Status message for a worker that had to be aborted on pause.
pub(crate) const FORCED_STOP_NOTE: &str = "stopped (forced)";

/// What every spawned worker is wired to.
pub struct WorkerDeps {
    /// Builds each worker's transport.
    pub transports: Arc<dyn TransportFactory>,
    /// Credential storage.
    pub credentials: Arc<dyn CredentialStore>,
    /// Where status events go.
    pub sink: Arc<dyn StatusSink>,
    /// Worker tunables.
    pub policy: Arc<WorkerPolicy>,
}

/// Holds at most one live worker per identity.
pub struct SessionRegistry {
    slots: Mutex<HashMap<Identity, Arc<WorkerHandle>>>,
    deps: WorkerDeps,
    spawned: AtomicU64,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new(deps: WorkerDeps) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            deps,
            spawned: AtomicU64::new(0),
        })
    }

    /// Live worker for `identity`, spawning one if none is registered. A
    /// slot whose task already exited is replaced.
    pub fn acquire(self: &Arc<Self>, identity: &Identity) -> Arc<WorkerHandle> {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(identity) {
            if !existing.is_finished() {
                return Arc::clone(existing);
            }
            debug!(identity = %identity, worker = %existing.id(), "replacing exited worker");
            // The exited task never released its slot.
            metrics::gauge!(WORKERS_ACTIVE).decrement(1.0);
        }

        let (handle, worker) = worker::build(
            identity,
            WorkerContext {
                transport: self.deps.transports.create(identity),
                credentials: Arc::clone(&self.deps.credentials),
                sink: Arc::clone(&self.deps.sink),
                policy: Arc::clone(&self.deps.policy),
            },
        );
        let handle = Arc::new(handle);
        let registry = Arc::downgrade(self);
        let slot_identity = identity.clone();
        let worker_id = handle.id().clone();
        handle.attach(tokio::spawn(async move {
            worker.run().await;
            if let Some(registry) = registry.upgrade() {
                let _ = registry.release(&slot_identity, &worker_id);
            }
        }));

        let _ = slots.insert(identity.clone(), Arc::clone(&handle));
        let _ = self.spawned.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(WORKERS_SPAWNED_TOTAL).increment(1);
        metrics::gauge!(WORKERS_ACTIVE).increment(1.0);
        info!(identity = %identity, worker = %handle.id(), "worker spawned");
        handle
    }

    /// Remove `identity`'s slot if it still holds worker `worker`. A slot
    /// already taken over by a newer worker is left alone.
    pub fn release(&self, identity: &Identity, worker: &WorkerId) -> bool {
        let mut slots = self.slots.lock();
        if slots.get(identity).is_some_and(|h| h.id() == worker) {
            let _ = slots.remove(identity);
            metrics::gauge!(WORKERS_ACTIVE).decrement(1.0);
            debug!(identity = %identity, worker = %worker, "worker released");
            true
        } else {
            false
        }
    }

    /// Whether `identity` has a registered worker.
    #[must_use]
    pub fn exists(&self, identity: &Identity) -> bool {
        self.slots.lock().contains_key(identity)
    }

    /// Registered worker for `identity`, if any.
    #[must_use]
    pub fn get(&self, identity: &Identity) -> Option<Arc<WorkerHandle>> {
        self.slots.lock().get(identity).cloned()
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no worker is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Workers spawned since creation.
    #[must_use]
    pub fn spawned_total(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Pause every worker, waiting up to `grace` for each, then clear.
    /// Aborted workers never publish their own `idle`, so it is published
    /// for them.
    pub async fn shutdown_all(&self, grace: Duration) {
        let handles: Vec<_> = self.slots.lock().values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        info!(workers = handles.len(), "stopping all workers");
        let outcomes = join_all(handles.iter().map(|h| h.stop(StopMode::Pause, grace))).await;
        let mut forced = 0;
        for (handle, outcome) in handles.iter().zip(outcomes) {
            let _ = self.release(handle.identity(), handle.id());
            if outcome == StopOutcome::Forced {
                forced += 1;
                self.deps
                    .sink
                    .emit(StatusEvent::status(
                        handle.identity().clone(),
                        ConnectionState::Idle,
                        Some(FORCED_STOP_NOTE.into()),
                    ))
                    .await;
            }
        }
        info!(workers = handles.len(), forced, "all workers stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
