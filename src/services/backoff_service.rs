//! Retry delay computation for failed deliveries and scheduled actions.

use rand::Rng;
use serde::{Deserialize, Serialize};

const MS_PER_MINUTE: f64 = 60_000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    pub base_minutes: f64,
    pub max_minutes: f64,
    /// Fraction of the delay added as random jitter, in `[0, 1]`
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_minutes: 1.0,
            max_minutes: 60.0,
            jitter_ratio: 0.2,
        }
    }
}

/// Delay before retry number `attempt` (1-based), in milliseconds.
///
/// `min(max, base * 2^(attempt-1))` minutes plus up to `jitter_ratio` of that
/// delay. Jitter is only ever added, and the cap holds even when `base`
/// exceeds `max`. `attempt <= 0` returns the (capped) base delay without
/// jitter.
pub fn next_backoff_ms(attempt: i64, policy: &BackoffPolicy) -> u64 {
    next_backoff_ms_with(attempt, policy, rand::thread_rng().gen::<f64>())
}

/// Same as [`next_backoff_ms`] with the random draw supplied, `unit` in `[0, 1)`
pub fn next_backoff_ms_with(attempt: i64, policy: &BackoffPolicy, unit: f64) -> u64 {
    let base = sanitize_minutes(policy.base_minutes, 0.0);
    let max = sanitize_minutes(policy.max_minutes, base);

    if attempt <= 0 {
        return minutes_to_ms(base.min(max));
    }

    // 2^63 already exceeds any sane cap; clamp the exponent to stay finite
    let exponent = (attempt - 1).min(62) as i32;
    let delay = (base * 2f64.powi(exponent)).min(max);

    let ratio = if policy.jitter_ratio.is_finite() {
        policy.jitter_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.0 };

    minutes_to_ms(delay + delay * ratio * unit)
}

/// Upper bound `next_backoff_ms` can ever return for a policy
pub fn max_backoff_ms(policy: &BackoffPolicy) -> u64 {
    let base = sanitize_minutes(policy.base_minutes, 0.0);
    let max = sanitize_minutes(policy.max_minutes, base);
    let ratio = if policy.jitter_ratio.is_finite() {
        policy.jitter_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    minutes_to_ms(max * (1.0 + ratio))
}

fn sanitize_minutes(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        fallback
    }
}

fn minutes_to_ms(minutes: f64) -> u64 {
    (minutes * MS_PER_MINUTE).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_minutes: 1.0,
            max_minutes: 30.0,
            jitter_ratio: 0.5,
        }
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let p = policy();
        assert_eq!(next_backoff_ms_with(1, &p, 0.0), 60_000);
        assert_eq!(next_backoff_ms_with(2, &p, 0.0), 120_000);
        assert_eq!(next_backoff_ms_with(3, &p, 0.0), 240_000);
        assert_eq!(next_backoff_ms_with(5, &p, 0.0), 960_000);
    }

    #[test]
    fn test_capped_at_max() {
        let p = policy();
        assert_eq!(next_backoff_ms_with(6, &p, 0.0), 1_800_000);
        assert_eq!(next_backoff_ms_with(1_000, &p, 0.0), 1_800_000);
        assert_eq!(next_backoff_ms_with(i64::MAX, &p, 0.0), 1_800_000);
    }

    #[test]
    fn test_cap_wins_over_larger_base() {
        let p = BackoffPolicy {
            base_minutes: 10.0,
            max_minutes: 5.0,
            jitter_ratio: 0.0,
        };
        assert_eq!(next_backoff_ms_with(1, &p, 0.0), 300_000);
        assert_eq!(next_backoff_ms_with(3, &p, 0.0), 300_000);
        assert_eq!(next_backoff_ms_with(0, &p, 0.0), 300_000);
        assert_eq!(max_backoff_ms(&p), 300_000);

        let jittered = BackoffPolicy { jitter_ratio: 0.2, ..p };
        assert!(next_backoff_ms_with(3, &jittered, 0.99) <= 360_000);
    }

    #[test]
    fn test_non_positive_attempt_returns_base() {
        let p = policy();
        assert_eq!(next_backoff_ms_with(0, &p, 0.99), 60_000);
        assert_eq!(next_backoff_ms_with(-3, &p, 0.99), 60_000);
    }

    #[test]
    fn test_jitter_is_added_never_subtracted() {
        let p = policy();
        let plain = next_backoff_ms_with(2, &p, 0.0);
        let jittered = next_backoff_ms_with(2, &p, 0.5);
        assert_eq!(jittered, plain + 30_000);
    }

    #[test]
    fn test_non_finite_inputs_fall_back() {
        let p = BackoffPolicy {
            base_minutes: 1.0,
            max_minutes: f64::NAN,
            jitter_ratio: f64::INFINITY,
        };
        assert_eq!(next_backoff_ms_with(4, &p, 0.7), 60_000);
        assert_eq!(next_backoff_ms_with(1, &policy(), f64::NAN), 60_000);
    }

    proptest! {
        #[test]
        fn prop_non_decreasing_up_to_cap(attempt in 1i64..64) {
            let p = policy();
            let here = next_backoff_ms_with(attempt, &p, 0.0);
            let next = next_backoff_ms_with(attempt + 1, &p, 0.0);
            prop_assert!(next >= here);
        }

        #[test]
        fn prop_bounded_by_cap_with_jitter(attempt in any::<i64>(), unit in 0.0f64..1.0) {
            let p = policy();
            let delay = next_backoff_ms_with(attempt, &p, unit);
            prop_assert!(delay <= max_backoff_ms(&p));
            prop_assert!(delay as f64 <= p.max_minutes * 60_000.0 * (1.0 + p.jitter_ratio));
        }

        #[test]
        fn prop_bounded_for_any_base_and_max(
            attempt in any::<i64>(),
            base in 0.0f64..120.0,
            max in 0.0f64..120.0,
            unit in 0.0f64..1.0,
        ) {
            let p = BackoffPolicy { base_minutes: base, max_minutes: max, jitter_ratio: 0.3 };
            let delay = next_backoff_ms_with(attempt, &p, unit);
            prop_assert!(delay as f64 <= (max * 60_000.0 * 1.3).round() + 1.0);
        }

        #[test]
        fn prop_random_variant_respects_bound(attempt in -5i64..100) {
            let p = policy();
            prop_assert!(next_backoff_ms(attempt, &p) <= max_backoff_ms(&p));
        }
    }
}
