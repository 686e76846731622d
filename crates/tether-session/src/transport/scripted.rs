//! In-process transport driven by a script or by hand.
//!
//! [`ScriptedTransportFactory`] keeps one *line* per identity. Every
//! transport created for that identity shares the line, so a
//! [`ScriptedHandle`] can inject network events into whichever link is
//! currently open and inspect everything the worker did: connect attempts
//! (with the credential offered), commands, and ends.
//!
//! With [`ScriptedBehavior::AutoPair`] the line plays a well-behaved
//! network on its own: it resumes when offered credentials and otherwise
//! asks for pairing, then immediately completes it. The daemon uses this
//! for local runs without a real gateway.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::{CredentialBlob, Identity, PairingMaterial, PairingMethod};
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use super::{
    EndReason, Transport, TransportCommand, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};

const EVENT_BUFFER: usize = 32;

/// How a scripted line reacts without outside help.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScriptedBehavior {
    /// Nothing happens unless a [`ScriptedHandle`] injects it.
    #[default]
    Manual,
    /// Resume with credentials or pair immediately on request.
    AutoPair,
}

#[derive(Default)]
struct LineState {
    events: Option<mpsc::Sender<TransportEvent>>,
    connects: Vec<Option<CredentialBlob>>,
    commands: Vec<TransportCommand>,
    ends: Vec<EndReason>,
    connect_failures: VecDeque<TransportError>,
    created: usize,
    pairings: usize,
}

#[derive(Default)]
struct Line {
    state: Mutex<LineState>,
    changed: Notify,
}

impl Line {
    fn touch(&self) {
        self.changed.notify_waiters();
    }
}

/// Test and inspection handle for one identity's line.
#[derive(Clone)]
pub struct ScriptedHandle {
    line: Arc<Line>,
}

impl ScriptedHandle {
    /// Deliver `event` on the currently open link. Returns `false` when no
    /// link is open or the worker stopped listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.line.state.lock().events.clone();
        sender.is_some_and(|tx| tx.try_send(event).is_ok())
    }

    /// Drop the open link's event sender without a close event.
    pub fn drop_stream(&self) {
        self.line.state.lock().events = None;
    }

    /// Make the next connect attempt fail with `error`. Queued failures
    /// are consumed in order.
    pub fn fail_next_connect(&self, error: TransportError) {
        self.line.state.lock().connect_failures.push_back(error);
    }

    /// Credentials offered on each connect attempt, in order.
    #[must_use]
    pub fn connects(&self) -> Vec<Option<CredentialBlob>> {
        self.line.state.lock().connects.clone()
    }

    /// Commands received, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<TransportCommand> {
        self.line.state.lock().commands.clone()
    }

    /// End reasons received, in order.
    #[must_use]
    pub fn ends(&self) -> Vec<EndReason> {
        self.line.state.lock().ends.clone()
    }

    /// Number of transports the factory built for this identity.
    #[must_use]
    pub fn transports_created(&self) -> usize {
        self.line.state.lock().created
    }

    /// Wait until at least `count` connect attempts have happened.
    pub async fn wait_for_connects(&self, count: usize) {
        self.wait_until(|s| s.connects.len() >= count).await;
    }

    /// Wait until at least `count` commands have been received.
    pub async fn wait_for_commands(&self, count: usize) {
        self.wait_until(|s| s.commands.len() >= count).await;
    }

    /// Wait until at least `count` ends have been received.
    pub async fn wait_for_ends(&self, count: usize) {
        self.wait_until(|s| s.ends.len() >= count).await;
    }

    async fn wait_until(&self, done: impl Fn(&LineState) -> bool) {
        loop {
            let notified = self.line.changed.notified();
            if done(&self.line.state.lock()) {
                return;
            }
            notified.await;
        }
    }
}

/// [`TransportFactory`] producing [`ScriptedTransport`]s.
#[derive(Default)]
pub struct ScriptedTransportFactory {
    lines: Mutex<HashMap<Identity, Arc<Line>>>,
    behavior: ScriptedBehavior,
}

impl ScriptedTransportFactory {
    /// Manual factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose lines follow `behavior`.
    #[must_use]
    pub fn with_behavior(behavior: ScriptedBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    fn line(&self, identity: &Identity) -> Arc<Line> {
        Arc::clone(self.lines.lock().entry(identity.clone()).or_default())
    }

    /// Handle for `identity`'s line, creating it if needed.
    #[must_use]
    pub fn handle(&self, identity: &Identity) -> ScriptedHandle {
        ScriptedHandle {
            line: self.line(identity),
        }
    }
}

impl TransportFactory for ScriptedTransportFactory {
    fn create(&self, identity: &Identity) -> Box<dyn Transport> {
        let line = self.line(identity);
        line.state.lock().created += 1;
        line.touch();
        Box::new(ScriptedTransport {
            identity: identity.clone(),
            line,
            behavior: self.behavior,
        })
    }
}

/// One worker's link on a scripted line.
pub struct ScriptedTransport {
    identity: Identity,
    line: Arc<Line>,
    behavior: ScriptedBehavior,
}

impl ScriptedTransport {
    fn push(&self, events: &[TransportEvent]) {
        let sender = self.line.state.lock().events.clone();
        if let Some(tx) = sender {
            for event in events {
                let _ = tx.try_send(event.clone());
            }
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &mut self,
        credential: Option<&CredentialBlob>,
    ) -> Result<TransportEvents, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let failure = {
            let mut state = self.line.state.lock();
            state.connects.push(credential.cloned());
            let failure = state.connect_failures.pop_front();
            if failure.is_none() {
                state.events = Some(tx);
            }
            failure
        };
        self.line.touch();
        if let Some(error) = failure {
            debug!(identity = %self.identity, %error, "scripted connect failure");
            return Err(error);
        }

        if self.behavior == ScriptedBehavior::AutoPair {
            if credential.is_some() {
                self.push(&[TransportEvent::Established]);
            } else {
                self.push(&[TransportEvent::PairingRequired]);
            }
        }
        Ok(rx)
    }

    async fn send(&mut self, command: TransportCommand) -> Result<(), TransportError> {
        let pairing = {
            let mut state = self.line.state.lock();
            state.commands.push(command.clone());
            state.pairings += 1;
            state.pairings
        };
        self.line.touch();

        if self.behavior == ScriptedBehavior::AutoPair {
            let TransportCommand::RequestPairing(method) = command;
            let material = match method {
                PairingMethod::Qr => PairingMaterial::Qr(format!("scripted:{}:{pairing}", self.identity)),
                PairingMethod::Code { .. } => PairingMaterial::Code(format!("TETH-{pairing:04}")),
            };
            self.push(&[
                TransportEvent::PairingMaterial(material),
                TransportEvent::Paired,
                TransportEvent::CredentialsUpdated(CredentialBlob::new(
                    format!("scripted:{}", self.identity).into_bytes(),
                )),
                TransportEvent::Established,
            ]);
        }
        Ok(())
    }

    async fn end(&mut self, reason: EndReason) -> Result<(), TransportError> {
        {
            let mut state = self.line.state.lock();
            state.ends.push(reason);
            state.events = None;
        }
        self.line.touch();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
