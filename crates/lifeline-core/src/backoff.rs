//! Exponential backoff math.
//!
//! Sync-only building blocks; the async reconnection loop lives in
//! `lifeline-engine`. Every function here is pure: the same attempt and
//! policy always yield the same delay. Jitter is derived from a caller
//! supplied seed instead of a hidden PRNG so delays stay reproducible.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default growth factor per attempt.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Parameters of an exponential backoff curve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first retry in ms.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Cap on the un-jittered delay in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether to apply jitter at all.
    #[serde(default)]
    pub jitter: bool,
    /// Jitter range as a fraction of the capped delay (0.0–1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
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

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: false,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the attempt following `attempt` completed attempts.
    ///
    /// `seed` only matters when jitter is enabled; a fixed seed gives a
    /// fixed delay for each attempt.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32, seed: u64) -> u64 {
        if self.jitter && self.jitter_factor > 0.0 {
            calculate_backoff_delay_with_random(
                attempt,
                self.base_delay_ms,
                self.multiplier,
                self.max_delay_ms,
                self.jitter_factor,
                jitter_fraction(seed, attempt),
            )
        } else {
            calculate_backoff_delay(
                attempt,
                self.base_delay_ms,
                self.multiplier,
                self.max_delay_ms,
            )
        }
    }

    /// Inclusive `(low, high)` range any jittered delay for `attempt` falls in.
    #[must_use]
    pub fn bounds_ms(&self, attempt: u32) -> (u64, u64) {
        let factor = if self.jitter {
            self.jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let low = calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.multiplier,
            self.max_delay_ms,
            factor,
            0.0,
        );
        let high = calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.multiplier,
            self.max_delay_ms,
            factor,
            1.0,
        );
        (low, high)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Exponential backoff without jitter.
///
/// Formula: `min(max_delay, base_delay * multiplier^attempt)`
///
/// `attempt` is zero-based: 0 yields `base_delay_ms`.
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
    let exponent = attempt.min(1024) as i32;
    let raw = (base_delay_ms as f64) * multiplier.max(1.0).powi(exponent);
    if !raw.is_finite() || raw >= max_delay_ms as f64 {
        return max_delay_ms;
    }
    raw.round() as u64
}

/// Exponential backoff with explicit randomness.
///
/// `random` should be in `[0.0, 1.0]`; it is mapped onto
/// `[-jitter_factor, +jitter_factor]` around the capped delay.
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
    let capped = calculate_backoff_delay(attempt, base_delay_ms, multiplier, max_delay_ms);

    // Maps random [0,1] to [-jitter, +jitter]
    let jitter = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}

/// Deterministic fraction in `[0.0, 1.0)` for a `(seed, attempt)` pair.
///
/// splitmix64 finalizer over the combined input.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn jitter_fraction(seed: u64, attempt: u32) -> f64 {
    let mut z = seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    // top 53 bits → [0, 1)
    (z >> 11) as f64 / (1u64 << 53) as f64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_attempt_is_base() {
        assert_eq!(calculate_backoff_delay(0, 1000, 2.0, 30_000), 1000);
    }

    #[test]
    fn doubles_per_attempt() {
        assert_eq!(calculate_backoff_delay(1, 1000, 2.0, 30_000), 2000);
        assert_eq!(calculate_backoff_delay(2, 1000, 2.0, 30_000), 4000);
        assert_eq!(calculate_backoff_delay(3, 1000, 2.0, 30_000), 8000);
    }

    #[test]
    fn non_integer_multiplier() {
        assert_eq!(calculate_backoff_delay(2, 1000, 1.5, 30_000), 2250);
    }

    #[test]
    fn capped_at_max() {
        assert_eq!(calculate_backoff_delay(10, 1000, 2.0, 30_000), 30_000);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        assert_eq!(calculate_backoff_delay(u32::MAX, 1000, 2.0, 30_000), 30_000);
    }

    #[test]
    fn multiplier_below_one_is_flat() {
        assert_eq!(calculate_backoff_delay(5, 1000, 0.5, 30_000), 1000);
    }

    // -- calculate_backoff_delay_with_random --

    #[test]
    fn with_random_zero_is_lower_bound() {
        // random = 0.0 → jitter = 1 - 0.1
        let delay = calculate_backoff_delay_with_random(0, 1000, 2.0, 30_000, 0.1, 0.0);
        assert_eq!(delay, 900);
    }

    #[test]
    fn with_random_half_is_centre() {
        let delay = calculate_backoff_delay_with_random(0, 1000, 2.0, 30_000, 0.1, 0.5);
        assert_eq!(delay, 1000);
    }

    #[test]
    fn with_random_one_is_upper_bound() {
        let delay = calculate_backoff_delay_with_random(0, 1000, 2.0, 30_000, 0.1, 1.0);
        assert_eq!(delay, 1100);
    }

    // -- BackoffPolicy --

    #[test]
    fn policy_without_jitter_ignores_seed() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_ms(3, 1), policy.delay_ms(3, 999));
        assert_eq!(policy.delay_ms(3, 1), 8000);
    }

    #[test]
    fn policy_with_jitter_is_repeatable() {
        let policy = BackoffPolicy {
            jitter: true,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_ms(2, 42), policy.delay_ms(2, 42));
    }

    #[test]
    fn bounds_without_jitter_collapse() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.bounds_ms(1), (2000, 2000));
    }

    #[test]
    fn policy_serde_defaults() {
        let policy: BackoffPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, BackoffPolicy::default());
        let policy: BackoffPolicy = serde_json::from_str(r#"{"baseDelayMs": 50}"#).unwrap();
        assert_eq!(policy.base_delay_ms, 50);
    }

    #[test]
    fn jitter_fraction_in_unit_interval() {
        for seed in [0, 1, u64::MAX, 0xDEAD_BEEF] {
            for attempt in 0..50 {
                let f = jitter_fraction(seed, attempt);
                assert!((0.0..1.0).contains(&f), "{f} out of range");
            }
        }
    }

    proptest! {
        #[test]
        fn delay_is_pure(attempt in 0u32..64, seed in any::<u64>(), jitter in any::<bool>()) {
            let policy = BackoffPolicy { jitter, ..BackoffPolicy::default() };
            prop_assert_eq!(policy.delay_ms(attempt, seed), policy.delay_ms(attempt, seed));
        }

        #[test]
        fn jittered_delay_within_bounds(attempt in 0u32..64, seed in any::<u64>()) {
            let policy = BackoffPolicy { jitter: true, ..BackoffPolicy::default() };
            let (low, high) = policy.bounds_ms(attempt);
            let delay = policy.delay_ms(attempt, seed);
            prop_assert!(low <= delay && delay <= high);
        }

        #[test]
        fn unjittered_delay_is_monotonic(attempt in 0u32..63) {
            let policy = BackoffPolicy::default();
            prop_assert!(policy.delay_ms(attempt, 0) <= policy.delay_ms(attempt + 1, 0));
        }
    }
}
