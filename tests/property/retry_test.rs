// tests/property/retry_test.rs

//! Property-based tests for reconnect policies
//! Tests delay bounds of the exponential backoff and the fixed-list policy

use hublink::{DefaultRetryPolicy, ExponentialBackoffPolicy, RetryContext, RetryPolicy};
use proptest::prelude::*;
use std::time::Duration;

fn context(previous_retry_count: u64) -> RetryContext {
    RetryContext {
        previous_retry_count,
        elapsed: Duration::ZERO,
        retry_reason: None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_backoff_base_delay_is_bounded_and_monotonic(
        initial_ms in 1u64..5_000,
        extra_ms in 0u64..120_000,
        attempt in 0u64..200
    ) {
        let initial = Duration::from_millis(initial_ms);
        let max = Duration::from_millis(initial_ms + extra_ms);
        let policy = ExponentialBackoffPolicy::new(initial, max);

        let delay = policy.base_delay(attempt);
        prop_assert!(delay >= initial);
        prop_assert!(delay <= max);
        prop_assert!(policy.base_delay(attempt + 1) >= delay);
    }

    #[test]
    fn test_backoff_jitter_stays_below_bound(
        attempt in 0u64..50,
        jitter_ms in 0u64..1_000
    ) {
        let policy = ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_max_jitter(Duration::from_millis(jitter_ms));

        let base = policy.base_delay(attempt);
        let delay = policy.next_retry_delay(&context(attempt)).unwrap();
        prop_assert!(delay >= base);
        prop_assert!(delay <= base + Duration::from_millis(jitter_ms));
    }

    #[test]
    fn test_backoff_respects_max_attempts(max_attempts in 0u64..20, attempt in 0u64..40) {
        let policy = ExponentialBackoffPolicy::default().with_max_attempts(max_attempts);
        let delay = policy.next_retry_delay(&context(attempt));
        prop_assert_eq!(delay.is_some(), attempt < max_attempts);
    }

    #[test]
    fn test_fixed_delays_are_used_in_order(
        delays_ms in prop::collection::vec(0u64..10_000, 0..10),
        attempt in 0u64..15
    ) {
        let delays: Vec<Duration> = delays_ms.iter().copied().map(Duration::from_millis).collect();
        let policy = DefaultRetryPolicy::with_delays(delays.clone());
        prop_assert_eq!(
            policy.next_retry_delay(&context(attempt)),
            delays.get(attempt as usize).copied()
        );
    }
}
