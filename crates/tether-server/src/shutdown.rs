//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tether_session::SessionRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default timeout for draining server tasks before giving up.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinates shutdown of workers, sockets, and the HTTP listener.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shut everything down in order.
    ///
    /// 1. Pause every connection worker (credentials are kept, so the next
    ///    process resumes without pairing), up to `worker_grace` each
    /// 2. Cancel the token, closing sockets and the listener
    /// 3. Wait up to `timeout` for `handles`
    pub async fn graceful_shutdown(
        &self,
        registry: &SessionRegistry,
        worker_grace: Duration,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        registry.shutdown_all(worker_grace).await;

        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tether_core::{Identity, MemoryCredentialStore, StatusEvent};
    use tether_session::transport::scripted::ScriptedTransportFactory;
    use tether_session::{StatusSink, WorkerDeps, WorkerPolicy};

    use super::*;

    struct NullSink;

    #[async_trait::async_trait]
    impl StatusSink for NullSink {
        async fn emit(&self, _event: StatusEvent) {}
    }

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(WorkerDeps {
            transports: Arc::new(ScriptedTransportFactory::new()),
            credentials: Arc::new(MemoryCredentialStore::new()),
            sink: Arc::new(NullSink),
            policy: Arc::new(WorkerPolicy::default()),
        })
    }

    #[test]
    fn token_propagation() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(token.is_cancelled());
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn graceful_shutdown_stops_workers_then_tasks() {
        let coord = ShutdownCoordinator::new();
        let registry = registry();
        let handle = registry.acquire(&Identity::from("op-1"));
        let _ = handle.start().await;

        let token = coord.token();
        let task = tokio::spawn(async move {
            token.cancelled().await;
        });

        coord
            .graceful_shutdown(&registry, Duration::from_secs(1), vec![task], None)
            .await;
        assert!(coord.is_shutting_down());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn graceful_shutdown_times_out() {
        let coord = ShutdownCoordinator::new();
        let registry = registry();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        coord
            .graceful_shutdown(
                &registry,
                Duration::from_millis(10),
                vec![task],
                Some(Duration::from_millis(100)),
            )
            .await;
        assert!(coord.is_shutting_down());
    }
}
