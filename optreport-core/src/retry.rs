//! Bounded retry with non-decreasing backoff.
//!
//! The failure this guards against is "the publisher has not released today's
//! data yet", which only resolves with wall-clock time. Waits therefore grow
//! with the attempt index and are measured in minutes, and only errors that
//! declare themselves retryable consume the attempt budget. Anything else
//! aborts on the spot so the fail-safe alert goes out without delay.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// How the wait grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `base × attempt`.
    Linear,
    /// `base × factor^(attempt-1)`. Factors below 1 are treated as 1.
    Exponential { factor: f64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear
    }
}

/// Where the policy sleeps. Swapped for a recorder in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested sleeps without waiting.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut v) = self.slept.lock() {
            v.push(duration);
        }
    }
}

/// Successful outcome plus what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub waited: Duration,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        waited: Duration,
        last_error: E,
    },

    #[error("non-retryable failure on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Aborted { error, .. } => error,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Aborted { error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Bookkeeping for one `run_with_retry` invocation.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    waited: Duration,
    last_delay: Duration,
    last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_interval: Duration,
    backoff: Backoff,
    jitter_fraction: f64,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, base_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_interval,
            backoff: Backoff::Linear,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Add up to `fraction × delay` of random extra wait. Clamped to `[0, 1]`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Nominal wait after failed attempt number `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self
                .base_interval
                .checked_mul(attempt)
                .unwrap_or(Duration::MAX),
            Backoff::Exponential { factor } => {
                let factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
                scale(self.base_interval, factor.powi(attempt as i32 - 1))
            }
        }
    }

    /// Longest total wait a single invocation can spend sleeping (jitter included).
    pub fn worst_case_wait(&self) -> Duration {
        (1..self.max_attempts)
            .map(|a| scale(self.delay_for(a), 1.0 + self.jitter_fraction))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the budget runs out.
    ///
    /// The closure receives the 1-based attempt number. Attempts are strictly
    /// sequential.
    pub fn run_with_retry<T, E, F>(
        &self,
        sleeper: &dyn Sleeper,
        mut operation: F,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut state = RetryState::default();

        loop {
            state.attempt += 1;
            debug!(
                attempt = state.attempt,
                max_attempts = self.max_attempts,
                previous_error = state.last_error.as_deref().unwrap_or(""),
                "starting attempt"
            );

            let error = match operation(state.attempt) {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: state.attempt,
                        waited: state.waited,
                    })
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                warn!(attempt = state.attempt, error = %error, "non-retryable failure; aborting");
                return Err(RetryError::Aborted {
                    attempt: state.attempt,
                    error,
                });
            }

            if state.attempt >= self.max_attempts {
                warn!(attempts = state.attempt, error = %error, "retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts: state.attempt,
                    waited: state.waited,
                    last_error: error,
                });
            }

            let delay = self.next_delay(&state);
            warn!(
                attempt = state.attempt,
                max_attempts = self.max_attempts,
                wait_secs = delay.as_secs_f64(),
                error = %error,
                "attempt failed; waiting before retry"
            );
            state.last_error = Some(error.to_string());
            sleeper.sleep(delay);
            state.waited = state.waited.saturating_add(delay);
            state.last_delay = delay;
        }
    }

    fn next_delay(&self, state: &RetryState) -> Duration {
        let nominal = self.delay_for(state.attempt);
        let jittered = if self.jitter_fraction > 0.0 && !nominal.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter_fraction);
            scale(nominal, 1.0 + extra)
        } else {
            nominal
        };
        // Keep the schedule non-decreasing even when jitter overshot last time.
        jittered.max(state.last_delay)
    }
}

/// `d × factor`, saturating at `Duration::MAX`.
fn scale(d: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

impl Default for RetryPolicy {
    /// Six attempts, thirty minutes apart and growing linearly.
    fn default() -> Self {
        Self::new(6, Duration::from_secs(30 * 60))
    }
}
