//! `/health`: liveness plus a snapshot of session load.
//!
//! The endpoint is unauthenticated, so it reports counts only, never
//! identities.

use std::time::Instant;

use serde::Serialize;

/// Overall server condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerCondition {
    /// Accepting commands.
    Ok,
    /// Shutdown started; workers are being paused.
    Draining,
}

/// Connection worker counts.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    /// Workers currently registered.
    pub live: usize,
    /// Workers spawned since startup.
    pub spawned: u64,
}

/// Webhook ingestion, present only with the HTTP gateway transport.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookHealth {
    /// Gateway sessions a live worker is listening on.
    pub routes: usize,
}

/// `/health` response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall condition.
    pub status: ServerCondition,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Open status sockets.
    pub sockets: usize,
    /// Worker counts.
    pub workers: WorkerHealth,
    /// Webhook routing, when enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhooks: Option<WebhookHealth>,
}

/// Counters sampled from the running server.
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct HealthSample {
    pub started: Instant,
    pub draining: bool,
    pub sockets: usize,
    pub live_workers: usize,
    pub spawned_workers: u64,
    /// `None` when webhooks are not enabled.
    pub webhook_routes: Option<usize>,
}

impl From<HealthSample> for HealthResponse {
    fn from(sample: HealthSample) -> Self {
        Self {
            status: if sample.draining {
                ServerCondition::Draining
            } else {
                ServerCondition::Ok
            },
            uptime_secs: sample.started.elapsed().as_secs(),
            sockets: sample.sockets,
            workers: WorkerHealth {
                live: sample.live_workers,
                spawned: sample.spawned_workers,
            },
            webhooks: sample.webhook_routes.map(|routes| WebhookHealth { routes }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sample() -> HealthSample {
        HealthSample {
            started: Instant::now(),
            draining: false,
            sockets: 0,
            live_workers: 0,
            spawned_workers: 0,
            webhook_routes: None,
        }
    }

    #[test]
    fn draining_is_reported() {
        let resp = HealthResponse::from(HealthSample {
            draining: true,
            ..sample()
        });
        assert_eq!(resp.status, ServerCondition::Draining);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "draining");
    }

    #[test]
    fn webhooks_omitted_unless_enabled() {
        let json = serde_json::to_value(HealthResponse::from(sample())).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json.get("webhooks").is_none());

        let json = serde_json::to_value(HealthResponse::from(HealthSample {
            webhook_routes: Some(3),
            ..sample()
        }))
        .unwrap();
        assert_eq!(json["webhooks"]["routes"], 3);
    }

    #[test]
    fn worker_counts_are_nested() {
        let json = serde_json::to_value(HealthResponse::from(HealthSample {
            started: Instant::now().checked_sub(Duration::from_secs(90)).unwrap(),
            sockets: 2,
            live_workers: 1,
            spawned_workers: 4,
            ..sample()
        }))
        .unwrap();
        assert_eq!(json["sockets"], 2);
        assert_eq!(json["workers"]["live"], 1);
        assert_eq!(json["workers"]["spawned"], 4);
        assert!(json["uptime_secs"].as_u64().unwrap() >= 89);
    }
}
