//! Reconnection policy and exponential backoff calculation.
//!
//! The async reconnect loop lives in `hail-client` (which has access to
//! tokio); this module contains the portable, sync-only building blocks:
//!
//! - [`ReconnectPolicy`]: backoff parameters and the attempt cap
//! - [`delay_for_attempt`]: pure exponential backoff
//! - [`delay_for_attempt_with_random`]: backoff with explicit jitter

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default maximum reconnection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Parameters governing reconnection after a dropped connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Base delay for exponential backoff in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling on the computed delay in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempts allowed before the connection is declared permanently
    /// failed (default: 10).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay for the given 1-based attempt number, without jitter.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        delay_for_attempt(attempt, self.base_delay_ms, self.max_delay_ms)
    }

    /// Whether the given 1-based attempt number exceeds the cap.
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// Calculate an exponential backoff delay.
///
/// Formula: `min(base_delay * 2^(attempt-1), max_delay)` with `attempt`
/// 1-based; attempt 0 is treated as 1. The shift is clamped so very high
/// attempt counts cannot overflow.
#[must_use]
pub fn delay_for_attempt(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(31);
    let exponential = base_delay_ms.saturating_mul(1u64 << exponent);
    exponential.min(max_delay_ms)
}

/// Calculate a backoff delay with explicit jitter randomness.
///
/// `random` should be a value in `[0.0, 1.0)` from a PRNG. Jitter is
/// symmetric: a factor of 0.2 varies the delay by ±20%.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn delay_for_attempt_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let capped = delay_for_attempt(attempt, base_delay_ms, max_delay_ms);

    // Maps random [0,1) to [-jitter, +jitter]
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor;
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- ReconnectPolicy --

    #[test]
    fn policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert_eq!(policy.max_attempts, 10);
        assert!((policy.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn policy_serde_defaults() {
        let policy: ReconnectPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_attempts, 10);
    }

    #[test]
    fn policy_serde_roundtrip() {
        let policy = ReconnectPolicy {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            max_attempts: 3,
            jitter_factor: 0.1,
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("baseDelayMs"));
        let back: ReconnectPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_attempts, 3);
        assert_eq!(back.max_delay_ms, 10_000);
    }

    #[test]
    fn exhaustion_boundary() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(!policy.is_exhausted(1));
        assert!(!policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    // -- delay_for_attempt --

    #[test]
    fn first_attempt_uses_base_delay() {
        assert_eq!(delay_for_attempt(1, 1000, 30_000), 1000);
    }

    #[test]
    fn attempt_zero_treated_as_first() {
        assert_eq!(delay_for_attempt(0, 1000, 30_000), 1000);
    }

    #[test]
    fn exponential_growth() {
        assert_eq!(delay_for_attempt(2, 1000, 30_000), 2000);
        assert_eq!(delay_for_attempt(3, 1000, 30_000), 4000);
        assert_eq!(delay_for_attempt(4, 1000, 30_000), 8000);
        assert_eq!(delay_for_attempt(5, 1000, 30_000), 16_000);
    }

    #[test]
    fn caps_at_max_delay() {
        assert_eq!(delay_for_attempt(6, 1000, 30_000), 30_000);
        assert_eq!(delay_for_attempt(10, 1000, 30_000), 30_000);
    }

    #[test]
    fn high_attempt_no_overflow() {
        let delay = delay_for_attempt(u32::MAX, 1000, 30_000);
        assert_eq!(delay, 30_000);
    }

    #[test]
    fn delay_never_exceeds_max_across_attempt_sequence() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..=policy.max_attempts {
            assert!(policy.delay_ms(attempt) <= policy.max_delay_ms);
        }
    }

    // -- delay_for_attempt_with_random --

    #[test]
    fn jitter_random_zero_shrinks() {
        // random = 0.0 → jitter = 1 - 0.2 = 0.8
        let delay = delay_for_attempt_with_random(1, 1000, 30_000, 0.2, 0.0);
        assert_eq!(delay, 800);
    }

    #[test]
    fn jitter_random_half_is_neutral() {
        let delay = delay_for_attempt_with_random(1, 1000, 30_000, 0.2, 0.5);
        assert_eq!(delay, 1000);
    }

    #[test]
    fn jitter_random_one_grows() {
        let delay = delay_for_attempt_with_random(1, 1000, 30_000, 0.2, 1.0);
        assert_eq!(delay, 1200);
    }

    #[test]
    fn jitter_applies_after_cap() {
        let delay = delay_for_attempt_with_random(20, 1000, 30_000, 0.2, 0.5);
        assert_eq!(delay, 30_000);
    }
}
