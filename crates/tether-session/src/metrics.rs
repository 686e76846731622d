//! Metric names recorded by the session layer.

/// Worker state transitions (labels: `to`).
pub const TRANSITIONS_TOTAL: &str = "session_transitions_total";
/// Reconnect attempts scheduled.
pub const RECONNECTS_TOTAL: &str = "session_reconnects_total";
/// Workers currently registered.
pub const WORKERS_ACTIVE: &str = "session_workers_active";
/// Workers spawned since start.
pub const WORKERS_SPAWNED_TOTAL: &str = "session_workers_spawned_total";
/// Workers force-ended after the teardown grace ran out.
pub const WORKERS_FORCED_TOTAL: &str = "session_workers_forced_total";
/// Status updates published.
pub const UPDATES_PUBLISHED_TOTAL: &str = "status_updates_published_total";
/// Updates dropped because a subscriber's buffer was full.
pub const UPDATES_DROPPED_TOTAL: &str = "status_updates_dropped_total";
/// Live subscribers.
pub const SUBSCRIBERS_ACTIVE: &str = "status_subscribers_active";
/// Store write retries (labels: `op`).
pub const PERSISTENCE_RETRIES_TOTAL: &str = "persistence_retries_total";
