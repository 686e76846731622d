//! Connection worker: one task per identity running the link state machine.
//!
//! The worker owns its [`Transport`] and its [`ConnectionSession`]. Nothing
//! else mutates either; the outside world talks to it through a
//! [`WorkerHandle`] (commands in, state watch out) and hears from it through
//! the [`StatusSink`].
//!
//! ```text
//!             start
//!   Idle ─────────────▶ Connecting ──────────▶ Connected
//!                        │  ▲   │ pairing          │
//!                        │  │   ▼ required         │ transient close
//!                        │  │  AwaitingPairing ────┤
//!                        │  │   (refresh loops)    ▼
//!                        │  └──────────────── Reconnecting
//!                        ▼        backoff          │ attempts exhausted
//!                 LoggedOut / Error ◀──────────────┘
//! ```
//!
//! Every transition is checked against [`ConnectionState::can_transition_to`]
//! and reported to the sink before the worker does anything else, so the
//! published projection never lags the worker by more than one event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tether_core::{
    BackoffPolicy, ConnectionState, CredentialBlob, CredentialRecord, CredentialStore,
    ErrorCause, Identity, PairingMaterial, PairingMethod, StatusEvent, StatusPayload, StopMode,
    WorkerId,
};
use tether_settings::TetherSettings;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::metrics::{RECONNECTS_TOTAL, TRANSITIONS_TOTAL, WORKERS_FORCED_TOTAL};
use crate::publisher::StatusSink;
use crate::retry::{PersistenceRetry, with_retry};
use crate::transport::{
    DisconnectReason, EndReason, Transport, TransportCommand, TransportEvent, TransportEvents,
};

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables every worker follows.
#[derive(Clone, Debug)]
pub struct WorkerPolicy {
    /// Reconnect schedule.
    pub backoff: BackoffPolicy,
    /// How long pairing may stay unfinished before the worker gives up.
    pub pairing_timeout: Duration,
    /// How often a displayed QR is requested again while pairing.
    pub pairing_refresh: Duration,
    /// Upper bound on closing the transport during stop.
    pub teardown_grace: Duration,
    /// Pairing method requested when the network asks for pairing.
    pub pairing: PairingMethod,
    /// Credential write retry.
    pub persistence: PersistenceRetry,
    /// Command channel capacity.
    pub command_buffer: usize,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self::from_settings(&TetherSettings::default())
    }
}

impl WorkerPolicy {
    /// Build from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &TetherSettings) -> Self {
        Self {
            backoff: settings.backoff.clone(),
            pairing_timeout: Duration::from_millis(settings.worker.pairing_timeout_ms),
            pairing_refresh: Duration::from_millis(settings.worker.pairing_refresh_ms),
            teardown_grace: Duration::from_millis(settings.worker.teardown_grace_ms),
            pairing: settings.worker.pairing.clone(),
            persistence: PersistenceRetry::from(&settings.persistence),
            command_buffer: settings.worker.command_buffer.max(1),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session record
// ─────────────────────────────────────────────────────────────────────────────

/// Worker-private view of one identity's link.
#[derive(Clone, Debug)]
pub struct ConnectionSession {
    /// Identity.
    pub identity: Identity,
    /// Current state.
    pub state: ConnectionState,
    /// Pairing material on display, only while `AwaitingPairing`.
    pub pairing_payload: Option<PairingMaterial>,
    /// When `state` was entered.
    pub last_transition_at: DateTime<Utc>,
    /// Reconnect attempts since the last successful connect.
    pub retry_count: u32,
    /// Delay used for the latest reconnect; the next one is never shorter.
    pub last_backoff: Duration,
}

impl ConnectionSession {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            state: ConnectionState::Idle,
            pairing_payload: None,
            last_transition_at: Utc::now(),
            retry_count: 0,
            last_backoff: Duration::ZERO,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) enum WorkerCommand {
    Start,
    Stop {
        mode: StopMode,
        done: oneshot::Sender<()>,
    },
}

/// How a stop request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker tore down and acknowledged.
    Graceful,
    /// The worker had already exited.
    AlreadyGone,
    /// The grace period ran out and the task was aborted.
    Forced,
}

/// Control surface for one running worker.
pub struct WorkerHandle {
    id: WorkerId,
    identity: Identity,
    commands: mpsc::Sender<WorkerCommand>,
    session: watch::Receiver<ConnectionSession>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Unique per spawned worker; a replacement for the same identity gets a
    /// new one.
    #[must_use]
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Identity the worker drives.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Latest state the worker has published.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.session.borrow().state
    }

    /// Snapshot of the worker's session as of its last transition.
    #[must_use]
    pub fn session(&self) -> ConnectionSession {
        self.session.borrow().clone()
    }

    /// Whether the worker task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Ask the worker to start. Returns `false` if it already exited.
    pub async fn start(&self) -> bool {
        self.commands.send(WorkerCommand::Start).await.is_ok()
    }

    /// Stop the worker, waiting up to `grace` for its acknowledgement.
    pub async fn stop(&self, mode: StopMode, grace: Duration) -> StopOutcome {
        let (done, ack) = oneshot::channel();
        if self
            .commands
            .send(WorkerCommand::Stop { mode, done })
            .await
            .is_err()
        {
            return StopOutcome::AlreadyGone;
        }
        match timeout(grace, ack).await {
            Ok(Ok(())) => StopOutcome::Graceful,
            Ok(Err(_)) => StopOutcome::AlreadyGone,
            Err(_) => {
                warn!(identity = %self.identity, worker = %self.id, ?grace, "stop grace expired, aborting worker");
                metrics::counter!(WORKERS_FORCED_TOTAL).increment(1);
                self.abort();
                StopOutcome::Forced
            }
        }
    }

    /// Wait up to `limit` for the state to differ from `from`. Returns the
    /// state observed last.
    pub async fn wait_for_change(&self, from: ConnectionState, limit: Duration) -> ConnectionState {
        let mut rx = self.session.clone();
        let _ = timeout(limit, rx.wait_for(|s| s.state != from)).await;
        rx.borrow().state
    }

    /// Wait up to `limit` for the state to become `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.session.clone();
        matches!(timeout(limit, rx.wait_for(|s| s.state == target)).await, Ok(Ok(_)))
    }

    /// Wait up to `limit` for the worker task to exit.
    pub async fn wait_finished(&self, limit: Duration) -> bool {
        let mut rx = self.session.clone();
        timeout(limit, async { while rx.changed().await.is_ok() {} })
            .await
            .is_ok()
    }

    pub(crate) fn attach(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    pub(crate) fn abort(&self) {
        if let Some(task) = self.task.lock().as_ref() {
            task.abort();
        }
    }
}

/// Dependencies shared by every worker.
pub(crate) struct WorkerContext {
    pub transport: Box<dyn Transport>,
    pub credentials: Arc<dyn CredentialStore>,
    pub sink: Arc<dyn StatusSink>,
    pub policy: Arc<WorkerPolicy>,
}

/// Build a worker and its handle. The caller spawns [`ConnectionWorker::run`]
/// and attaches the join handle.
pub(crate) fn build(identity: &Identity, ctx: WorkerContext) -> (WorkerHandle, ConnectionWorker) {
    let (cmd_tx, cmd_rx) = mpsc::channel(ctx.policy.command_buffer);
    let session = ConnectionSession::new(identity.clone());
    let (state_tx, state_rx) = watch::channel(session.clone());
    let handle = WorkerHandle {
        id: WorkerId::new(),
        identity: identity.clone(),
        commands: cmd_tx,
        session: state_rx,
        task: Mutex::new(None),
    };
    let worker = ConnectionWorker {
        session,
        worker_id: handle.id.clone(),
        transport: ctx.transport,
        events: None,
        credentials: ctx.credentials,
        sink: ctx.sink,
        policy: ctx.policy,
        state_tx,
        commands: cmd_rx,
        reconnect_at: None,
        pairing_deadline: None,
        pairing_refresh_at: None,
    };
    (handle, worker)
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

enum Step {
    Command(Option<WorkerCommand>),
    Transport(Option<TransportEvent>),
    ReconnectDue,
    PairingExpired,
    PairingRefreshDue,
}

/// The state machine task.
pub(crate) struct ConnectionWorker {
    session: ConnectionSession,
    worker_id: WorkerId,
    transport: Box<dyn Transport>,
    events: Option<TransportEvents>,
    credentials: Arc<dyn CredentialStore>,
    sink: Arc<dyn StatusSink>,
    policy: Arc<WorkerPolicy>,
    state_tx: watch::Sender<ConnectionSession>,
    commands: mpsc::Receiver<WorkerCommand>,
    reconnect_at: Option<Instant>,
    pairing_deadline: Option<Instant>,
    pairing_refresh_at: Option<Instant>,
}

async fn next_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ConnectionWorker {
    /// Run until a stop command or a terminal state.
    pub(crate) async fn run(mut self) {
        debug!(identity = %self.session.identity, worker = %self.worker_id, "worker started");
        loop {
            let step = tokio::select! {
                biased;
                cmd = self.commands.recv() => Step::Command(cmd),
                event = next_event(&mut self.events) => Step::Transport(event),
                () = deadline(self.reconnect_at) => Step::ReconnectDue,
                () = deadline(self.pairing_deadline) => Step::PairingExpired,
                () = deadline(self.pairing_refresh_at) => Step::PairingRefreshDue,
            };
            let flow = match step {
                Step::Command(Some(WorkerCommand::Start)) => self.on_start().await,
                Step::Command(Some(WorkerCommand::Stop { mode, done })) => {
                    self.on_stop(mode).await;
                    let _ = done.send(());
                    Flow::Exit
                }
                Step::Command(None) => {
                    self.on_stop(StopMode::Pause).await;
                    Flow::Exit
                }
                Step::Transport(Some(event)) => self.on_transport_event(event).await,
                Step::Transport(None) => {
                    self.events = None;
                    self.on_closed(DisconnectReason::Transient("event stream ended".into()))
                        .await
                }
                Step::ReconnectDue => self.on_reconnect_due().await,
                Step::PairingExpired => self.on_pairing_expired().await,
                Step::PairingRefreshDue => self.on_pairing_refresh_due().await,
            };
            if flow == Flow::Exit {
                break;
            }
        }
        debug!(
            identity = %self.session.identity,
            worker = %self.worker_id,
            state = %self.session.state,
            "worker exited"
        );
    }

    // ── commands ────────────────────────────────────────────────────────────

    async fn on_start(&mut self) -> Flow {
        if self.session.state != ConnectionState::Idle {
            debug!(identity = %self.session.identity, state = %self.session.state, "start ignored");
            return Flow::Continue;
        }
        self.open_transport().await
    }

    async fn on_stop(&mut self, mode: StopMode) {
        self.clear_timers();
        self.events = None;
        let reason = match mode {
            StopMode::Pause => EndReason::Pause,
            StopMode::Logout => EndReason::Logout,
        };
        if self.session.state != ConnectionState::Idle || mode == StopMode::Logout {
            self.end_transport(reason).await;
        }
        if mode == StopMode::Logout {
            self.delete_credentials().await;
        }
        let target = mode.target_state();
        if self.session.state != target {
            let message = match mode {
                StopMode::Pause => "stopped",
                StopMode::Logout => "logged out",
            };
            self.transition(target, status(message)).await;
        }
    }

    // ── transport ───────────────────────────────────────────────────────────

    /// Enter `Connecting` and open the link, resuming with stored
    /// credentials when there are any.
    async fn open_transport(&mut self) -> Flow {
        let credential = self.load_credential();
        let note = if credential.is_some() {
            "resuming saved session"
        } else {
            "connecting"
        };
        self.transition(ConnectionState::Connecting, status(note)).await;

        let blob = credential.as_ref().map(|r| &r.blob);
        match self.transport.connect(blob).await {
            Ok(events) => {
                self.events = Some(events);
                Flow::Continue
            }
            Err(e) if e.is_retryable() => self.schedule_reconnect(&e.to_string()).await,
            Err(e) => self.fail(e.cause(), e.to_string()).await,
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Flow {
        use ConnectionState::{AwaitingPairing, Connected, Connecting};

        let state = self.session.state;
        match event {
            TransportEvent::PairingRequired => match state {
                Connecting => {
                    self.pairing_deadline = Some(Instant::now() + self.policy.pairing_timeout);
                    self.transition(AwaitingPairing, status("pairing required")).await;
                    self.request_pairing().await;
                }
                // The network still wants pairing; whatever is displayed may be stale.
                AwaitingPairing => self.request_pairing().await,
                _ => self.ignore("pairing_required"),
            },
            TransportEvent::PairingMaterial(material) => match state {
                AwaitingPairing if self.session.pairing_payload.as_ref() == Some(&material) => {
                    debug!(identity = %self.session.identity, "pairing material unchanged");
                }
                Connecting | AwaitingPairing => {
                    if self.pairing_deadline.is_none() {
                        self.pairing_deadline =
                            Some(Instant::now() + self.policy.pairing_timeout);
                    }
                    self.session.pairing_payload = Some(material.clone());
                    self.transition(AwaitingPairing, StatusPayload::Pairing(material))
                        .await;
                }
                _ => self.ignore("pairing_material"),
            },
            TransportEvent::Paired => match state {
                AwaitingPairing => {
                    self.pairing_deadline = None;
                    self.transition(Connecting, status("paired")).await;
                }
                _ => self.ignore("paired"),
            },
            TransportEvent::CredentialsUpdated(blob) => match state {
                Connecting | AwaitingPairing | Connected => self.persist_credentials(&blob).await,
                _ => self.ignore("credentials_updated"),
            },
            TransportEvent::Established => match state {
                Connecting | AwaitingPairing => {
                    self.pairing_deadline = None;
                    self.session.retry_count = 0;
                    self.session.last_backoff = Duration::ZERO;
                    self.transition(Connected, status("connected")).await;
                }
                _ => self.ignore("established"),
            },
            TransportEvent::Closed(reason) => return self.on_closed(reason).await,
        }
        Flow::Continue
    }

    async fn on_closed(&mut self, reason: DisconnectReason) -> Flow {
        use ConnectionState::{AwaitingPairing, Connected, Connecting};

        if !matches!(self.session.state, Connecting | AwaitingPairing | Connected) {
            self.ignore("closed");
            return Flow::Continue;
        }
        self.events = None;
        self.pairing_deadline = None;
        match reason {
            DisconnectReason::Transient(reason) => self.schedule_reconnect(&reason).await,
            DisconnectReason::LoggedOut(reason) => {
                info!(identity = %self.session.identity, %reason, "network ended the session");
                self.delete_credentials().await;
                self.transition(
                    ConnectionState::LoggedOut,
                    status(&format!("disconnected: {reason}")),
                )
                .await;
                self.end_transport(EndReason::Failed).await;
                Flow::Exit
            }
        }
    }

    /// Ask the transport for pairing material. QR codes rotate, so while
    /// pairing with QR the request repeats every `pairing_refresh`.
    async fn request_pairing(&mut self) {
        self.pairing_refresh_at = match self.policy.pairing {
            PairingMethod::Qr => Some(Instant::now() + self.policy.pairing_refresh),
            PairingMethod::Code { .. } => None,
        };
        let command = TransportCommand::RequestPairing(self.policy.pairing.clone());
        if let Err(e) = self.transport.send(command).await {
            warn!(identity = %self.session.identity, error = %e, "pairing request failed");
            let event = StatusEvent::error(
                self.session.identity.clone(),
                self.session.state,
                e.cause(),
                format!("pairing request failed: {e}"),
            );
            self.sink.emit(event).await;
        }
    }

    async fn end_transport(&mut self, reason: EndReason) {
        match timeout(self.policy.teardown_grace, self.transport.end(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(identity = %self.session.identity, error = %e, "transport end failed"),
            Err(_) => warn!(identity = %self.session.identity, "transport end timed out"),
        }
    }

    // ── timers ──────────────────────────────────────────────────────────────

    async fn schedule_reconnect(&mut self, reason: &str) -> Flow {
        let attempt = self.session.retry_count + 1;
        if self.policy.backoff.exhausted(attempt) {
            let message = format!(
                "gave up after {} reconnect attempts: {reason}",
                self.session.retry_count
            );
            return self.fail(ErrorCause::ReconnectExhausted, message).await;
        }
        self.session.retry_count = attempt;
        let delay = self.policy.backoff.next_delay(
            attempt,
            self.session.last_backoff,
            rand::random::<f64>(),
        );
        self.session.last_backoff = delay;
        self.reconnect_at = Some(Instant::now() + delay);
        metrics::counter!(RECONNECTS_TOTAL).increment(1);
        info!(
            identity = %self.session.identity,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %reason,
            "reconnect scheduled"
        );
        self.transition(
            ConnectionState::Reconnecting,
            status(&format!("reconnecting (attempt {attempt}): {reason}")),
        )
        .await;
        Flow::Continue
    }

    async fn on_reconnect_due(&mut self) -> Flow {
        self.reconnect_at = None;
        if self.session.state != ConnectionState::Reconnecting {
            return Flow::Continue;
        }
        self.open_transport().await
    }

    async fn on_pairing_expired(&mut self) -> Flow {
        self.pairing_deadline = None;
        if self.session.state != ConnectionState::AwaitingPairing {
            return Flow::Continue;
        }
        let message = format!(
            "pairing not completed within {}s",
            self.policy.pairing_timeout.as_secs()
        );
        self.fail(ErrorCause::PairingTimeout, message).await
    }

    async fn on_pairing_refresh_due(&mut self) -> Flow {
        self.pairing_refresh_at = None;
        if self.session.state == ConnectionState::AwaitingPairing {
            debug!(identity = %self.session.identity, "refreshing pairing material");
            self.request_pairing().await;
        }
        Flow::Continue
    }

    fn clear_timers(&mut self) {
        self.reconnect_at = None;
        self.pairing_deadline = None;
        self.pairing_refresh_at = None;
    }

    // ── terminal ────────────────────────────────────────────────────────────

    async fn fail(&mut self, cause: ErrorCause, message: String) -> Flow {
        error!(identity = %self.session.identity, cause = cause.code(), %message, "worker failed");
        self.clear_timers();
        self.events = None;
        self.transition(ConnectionState::Error, StatusPayload::Error { cause, message })
            .await;
        self.end_transport(EndReason::Failed).await;
        Flow::Exit
    }

    // ── credentials ─────────────────────────────────────────────────────────

    fn load_credential(&self) -> Option<CredentialRecord> {
        match self.credentials.get(&self.session.identity) {
            Ok(record) => record,
            Err(e) => {
                warn!(identity = %self.session.identity, error = %e, "credential load failed, pairing fresh");
                None
            }
        }
    }

    async fn persist_credentials(&mut self, blob: &CredentialBlob) {
        let identity = self.session.identity.clone();
        let store = Arc::clone(&self.credentials);
        let written = with_retry(self.policy.persistence, "credentials.put", || {
            store.put(&identity, blob)
        })
        .await;
        let event = match written {
            Ok(record) => {
                debug!(identity = %identity, bytes = record.blob.len(), "credentials persisted");
                StatusEvent::credential_update(identity, self.session.state)
            }
            Err(e) => {
                error!(identity = %identity, code = %e.code, error = %e, "credential write failed");
                StatusEvent::error(
                    identity,
                    self.session.state,
                    ErrorCause::Persistence,
                    format!("failed to persist credentials: {}", e.message),
                )
            }
        };
        self.sink.emit(event).await;
    }

    async fn delete_credentials(&mut self) {
        let identity = self.session.identity.clone();
        let store = Arc::clone(&self.credentials);
        match with_retry(self.policy.persistence, "credentials.delete", || store.delete(&identity)).await {
            Ok(existed) => debug!(identity = %identity, existed, "credentials deleted"),
            Err(e) => {
                error!(identity = %identity, code = %e.code, error = %e, "credential delete failed");
                let event = StatusEvent::error(
                    identity,
                    self.session.state,
                    ErrorCause::Persistence,
                    format!("failed to delete credentials: {}", e.message),
                );
                self.sink.emit(event).await;
            }
        }
    }

    // ── transitions ─────────────────────────────────────────────────────────

    /// Move to `next` and report it. Illegal moves are logged and skipped.
    async fn transition(&mut self, next: ConnectionState, payload: StatusPayload) {
        let from = self.session.state;
        if !from.can_transition_to(next) {
            warn!(identity = %self.session.identity, %from, to = %next, "illegal transition refused");
            return;
        }
        self.session.state = next;
        self.session.last_transition_at = Utc::now();
        if next != ConnectionState::AwaitingPairing {
            self.session.pairing_payload = None;
            self.pairing_refresh_at = None;
        }
        metrics::counter!(TRANSITIONS_TOTAL, "to" => next.as_str()).increment(1);
        info!(identity = %self.session.identity, %from, to = %next, "transition");

        let event = StatusEvent {
            identity: self.session.identity.clone(),
            state: next,
            payload,
            timestamp: self.session.last_transition_at,
        };
        self.sink.emit(event).await;
        let _ = self.state_tx.send_replace(self.session.clone());
    }

    fn ignore(&self, event: &'static str) {
        debug!(identity = %self.session.identity, state = %self.session.state, event, "transport event ignored");
    }
}

fn status(message: &str) -> StatusPayload {
    StatusPayload::Status {
        message: Some(message.to_owned()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
