//! Property tests for the rate limiter under both window algorithms.

use proptest::prelude::*;
use std::time::Duration;
use tollgate_core::{FailureMode, KeyBuilder, RateAlgorithm, Scope};
use tollgate_guard::RateLimiter;
use tollgate_test_utils::fixtures::memory_store_with_clock;
use tollgate_test_utils::generators::arb_rate_policy;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn algorithms() -> impl Strategy<Value = RateAlgorithm> {
    prop_oneof![Just(RateAlgorithm::SlidingWindow), Just(RateAlgorithm::FixedWindow)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_limit_admitted_then_denied_then_replenished(
        policy in arb_rate_policy(),
        algorithm in algorithms(),
        raw in "[a-z0-9]{1,16}",
    ) {
        let rt = runtime();
        let (store, clock) = memory_store_with_clock();
        let limiter = RateLimiter::new(store, algorithm, FailureMode::FailOpen).unwrap();
        let key = KeyBuilder::new("prop:rl").unwrap().build("op", Scope::Global, None, &raw);

        rt.block_on(async {
            for _ in 0..policy.limit() {
                assert!(limiter.check(&key, &policy).await.allowed);
            }

            let denied = limiter.check(&key, &policy).await;
            assert!(!denied.allowed);
            assert_eq!(denied.remaining, 0);
            assert!(denied.retry_after_secs >= 1);
            assert!(denied.retry_after_secs <= policy.window_secs());

            clock.advance(policy.window());
            assert!(limiter.check(&key, &policy).await.allowed);
        });
    }

    #[test]
    fn prop_retry_after_stays_in_window_as_time_passes(
        policy in arb_rate_policy(),
        algorithm in algorithms(),
        waits in proptest::collection::vec(0u64..5_000, 1..10),
    ) {
        let rt = runtime();
        let (store, clock) = memory_store_with_clock();
        let limiter = RateLimiter::new(store, algorithm, FailureMode::FailOpen).unwrap();
        let key = KeyBuilder::new("prop:rl").unwrap().build("op", Scope::Global, None, "k");

        rt.block_on(async {
            for _ in 0..policy.limit() {
                limiter.check(&key, &policy).await;
            }
            for wait in waits {
                clock.advance(Duration::from_millis(wait));
                let decision = limiter.check(&key, &policy).await;
                if !decision.allowed {
                    assert!((1..=policy.window_secs()).contains(&decision.retry_after_secs));
                }
            }
        });
    }
}
