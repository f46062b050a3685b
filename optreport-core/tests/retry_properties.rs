//! Property tests for the retry policy.
//!
//! 1. `k < max` retryable failures then success => `k + 1` attempts
//! 2. `max` retryable failures => exhausted after exactly `max` attempts
//! 3. A non-retryable failure stops at the attempt it happened on
//! 4. The wait schedule never decreases, with or without jitter

use std::fmt;
use std::time::Duration;

use optreport_core::{Backoff, RecordingSleeper, RetryError, RetryPolicy, Retryable};
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    NotPublished,
    Unauthorized,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Retryable for Outcome {
    fn is_retryable(&self) -> bool {
        matches!(self, Outcome::NotPublished)
    }
}

fn arb_backoff() -> impl Strategy<Value = Backoff> {
    prop_oneof![
        Just(Backoff::Linear),
        (1.0..3.0_f64).prop_map(|factor| Backoff::Exponential { factor }),
    ]
}

fn policy(max: u32, backoff: Backoff, jitter: f64) -> RetryPolicy {
    RetryPolicy::new(max, Duration::from_secs(60))
        .with_backoff(backoff)
        .with_jitter(jitter)
}

proptest! {
    #[test]
    fn succeeds_after_k_failures(max in 1u32..10, k_seed in 0u32..10, backoff in arb_backoff()) {
        let k = k_seed % max;
        let sleeper = RecordingSleeper::new();
        let mut calls = 0u32;

        let result = policy(max, backoff, 0.0)
            .run_with_retry(&sleeper, |attempt| {
                calls += 1;
                if attempt <= k { Err(Outcome::NotPublished) } else { Ok(attempt) }
            })
            .unwrap();

        prop_assert_eq!(result.attempts, k + 1);
        prop_assert_eq!(result.value, k + 1);
        prop_assert_eq!(calls, k + 1);
        prop_assert_eq!(sleeper.recorded().len() as u32, k);
        prop_assert_eq!(result.waited, sleeper.recorded().iter().sum::<Duration>());
    }

    #[test]
    fn exhausts_after_exactly_max(max in 1u32..10, backoff in arb_backoff()) {
        let sleeper = RecordingSleeper::new();
        let mut calls = 0u32;

        let err = policy(max, backoff, 0.0)
            .run_with_retry(&sleeper, |_| -> Result<(), Outcome> {
                calls += 1;
                Err(Outcome::NotPublished)
            })
            .unwrap_err();

        let is_exhausted = matches!(err, RetryError::Exhausted { .. });
        prop_assert!(is_exhausted);
        prop_assert_eq!(err.attempts(), max);
        prop_assert_eq!(calls, max);
        prop_assert_eq!(err.last_error(), &Outcome::NotPublished);
    }

    #[test]
    fn fatal_failure_stops_immediately(max in 1u32..10, fail_at_seed in 0u32..10) {
        let fail_at = fail_at_seed % max + 1;
        let sleeper = RecordingSleeper::new();
        let mut calls = 0u32;

        let err = policy(max, Backoff::Linear, 0.0)
            .run_with_retry(&sleeper, |attempt| -> Result<(), Outcome> {
                calls += 1;
                if attempt < fail_at {
                    Err(Outcome::NotPublished)
                } else {
                    Err(Outcome::Unauthorized)
                }
            })
            .unwrap_err();

        let is_aborted = matches!(err, RetryError::Aborted { .. });
        prop_assert!(is_aborted);
        prop_assert_eq!(err.attempts(), fail_at);
        prop_assert_eq!(calls, fail_at);
    }

    #[test]
    fn schedule_is_non_decreasing(
        max in 2u32..10,
        backoff in arb_backoff(),
        jitter in 0.0..1.0_f64,
    ) {
        let sleeper = RecordingSleeper::new();
        let _ = policy(max, backoff, jitter)
            .run_with_retry(&sleeper, |_| -> Result<(), Outcome> { Err(Outcome::NotPublished) });

        let slept = sleeper.recorded();
        prop_assert_eq!(slept.len() as u32, max - 1);
        for pair in slept.windows(2) {
            prop_assert!(pair[1] >= pair[0], "{:?}", slept);
        }
    }
}

#[test]
fn zero_interval_never_waits() {
    let sleeper = RecordingSleeper::new();
    let result = RetryPolicy::new(3, Duration::ZERO).run_with_retry(&sleeper, |attempt| {
        if attempt < 3 {
            Err(Outcome::NotPublished)
        } else {
            Ok(())
        }
    });

    assert_eq!(result.unwrap().waited, Duration::ZERO);
    assert!(sleeper.recorded().iter().all(|d| d.is_zero()));
}
