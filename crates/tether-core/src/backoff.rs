//! Reconnect backoff policy.
//!
//! Exponential growth by a configurable multiplier, symmetric jitter, and a
//! hard cap applied after jitter. Jitter alone can make a later draw shorter
//! than an earlier one, so a reconnect schedule goes through
//! [`BackoffPolicy::next_delay`], which never returns less than the delay it
//! was given for the previous attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default growth multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;
/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Reconnect schedule for a connection worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor per attempt (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Maximum delay between attempts in ms (default: 60000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Reconnect attempts allowed before the worker enters `Error` (default: 8).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Whether reconnect attempt `attempt` (1-based) is past the cap.
    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Delay before reconnect attempt `attempt` (1-based) given a random
    /// draw in `[0.0, 1.0]`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt.saturating_sub(1),
            self.base_delay_ms,
            self.multiplier,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        ))
    }

    /// Delay before attempt `attempt` when the previous attempt waited
    /// `previous`: the jittered delay, raised to `previous` if it fell short,
    /// capped at `max_delay_ms`. Pass [`Duration::ZERO`] for the first attempt.
    #[must_use]
    pub fn next_delay(&self, attempt: u32, previous: Duration, random: f64) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        self.delay_for(attempt, random).max(previous).min(cap)
    }
}

/// Nominal delay without jitter: `min(max_delay, base * multiplier^attempt)`.
///
/// `attempt` is zero-based.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay_ms: u64,
    multiplier: f64,
    max_delay_ms: u64,
) -> u64 {
    let growth = multiplier.max(1.0).powi(attempt.min(64) as i32);
    let exponential = (base_delay_ms as f64) * growth;
    if exponential >= max_delay_ms as f64 {
        max_delay_ms
    } else {
        exponential.round() as u64
    }
}

/// Delay with jitter: `min(max_delay, nominal * (1 + (random * 2 - 1) * jitter))`.
///
/// `random` maps `[0, 1]` to `[-jitter, +jitter]`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    multiplier: f64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let nominal = calculate_backoff_delay(attempt, base_delay_ms, multiplier, max_delay_ms);
    let jitter = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    let with_jitter = ((nominal as f64) * jitter).round().max(0.0) as u64;
    with_jitter.min(max_delay_ms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn policy_defaults() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 60_000);
        assert_eq!(policy.max_attempts, 8);
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn policy_serde_defaults() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{"maxAttempts": 3}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1000);
    }

    #[test]
    fn exponential_growth_without_jitter() {
        let d: Vec<u64> = (0..4)
            .map(|n| calculate_backoff_delay(n, 1000, 2.0, 60_000))
            .collect();
        assert_eq!(d, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn custom_multiplier() {
        assert_eq!(calculate_backoff_delay(2, 100, 3.0, 60_000), 900);
    }

    #[test]
    fn caps_at_max() {
        assert_eq!(calculate_backoff_delay(10, 1000, 2.0, 60_000), 60_000);
        assert_eq!(calculate_backoff_delay(500, 1000, 2.0, 60_000), 60_000);
    }

    #[test]
    fn jitter_bounds() {
        assert_eq!(calculate_backoff_delay_with_random(0, 1000, 2.0, 60_000, 0.2, 0.0), 800);
        assert_eq!(calculate_backoff_delay_with_random(0, 1000, 2.0, 60_000, 0.2, 0.5), 1000);
        assert_eq!(calculate_backoff_delay_with_random(0, 1000, 2.0, 60_000, 0.2, 1.0), 1200);
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let delay = calculate_backoff_delay_with_random(20, 1000, 2.0, 60_000, 0.2, 1.0);
        assert_eq!(delay, 60_000);
    }

    #[test]
    fn delay_for_is_one_based() {
        let policy = BackoffPolicy {
            jitter_factor: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_for(1, 0.5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2, 0.5), Duration::from_millis(2000));
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..BackoffPolicy::default()
        };
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn capped_delay_does_not_shrink_on_low_draw() {
        let policy = BackoffPolicy::default();
        let d7 = policy.next_delay(7, Duration::ZERO, 1.0);
        assert_eq!(d7, Duration::from_secs(60));
        // Without the floor this draw lands at 48s.
        assert_eq!(policy.delay_for(8, 0.0), Duration::from_secs(48));
        assert_eq!(policy.next_delay(8, d7, 0.0), Duration::from_secs(60));
    }

    #[test]
    fn flat_multiplier_schedule_never_shrinks() {
        let policy = BackoffPolicy {
            multiplier: 1.0,
            ..BackoffPolicy::default()
        };
        let d1 = policy.next_delay(1, Duration::ZERO, 1.0);
        assert_eq!(d1, Duration::from_millis(1200));
        assert_eq!(policy.next_delay(2, d1, 0.0), d1);
    }

    proptest! {
        #[test]
        fn schedule_is_monotonic_with_independent_draws(
            base in 1u64..10_000,
            multiplier in 1.0f64..4.0,
            max in 1u64..600_000,
            jitter in 0.0f64..1.0,
            draws in proptest::collection::vec(0.0f64..=1.0, 1..20),
        ) {
            let policy = BackoffPolicy {
                base_delay_ms: base,
                multiplier,
                max_delay_ms: max,
                jitter_factor: jitter,
                max_attempts: 64,
            };
            let mut previous = Duration::ZERO;
            for (attempt, random) in (1u32..).zip(draws) {
                let delay = policy.next_delay(attempt, previous, random);
                prop_assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
                prop_assert!(delay <= Duration::from_millis(max));
                previous = delay;
            }
        }

        #[test]
        fn nominal_delay_is_monotonic_for_fixed_draw(
            attempt in 0u32..40,
            base in 1u64..10_000,
            multiplier in 1.0f64..4.0,
            max in 1u64..600_000,
            jitter in 0.0f64..1.0,
            random in 0.0f64..1.0,
        ) {
            let a = calculate_backoff_delay_with_random(attempt, base, multiplier, max, jitter, random);
            let b = calculate_backoff_delay_with_random(attempt + 1, base, multiplier, max, jitter, random);
            prop_assert!(b >= a);
            prop_assert!(b <= max);
        }
    }
}
