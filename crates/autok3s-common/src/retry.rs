//! Backoff for cloud calls and bounded waits on eventually consistent state.
//!
//! Every provider API the engine talks to can throttle, time out, or answer
//! with stale data. Two helpers live here:
//!
//! - [`retry_with_backoff`] repeats a call while the caller's predicate deems
//!   the failure transient. A rejected credential is never retried.
//! - [`poll_until`] probes a resource until it settles. Running out of
//!   attempts is an error, never an unbounded wait.
//!
//! ```ignore
//! use autok3s_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let terminated = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "terminate_instances",
//!     Error::is_retryable,
//!     || async { cloud.terminate_instances(&ids).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Backoff schedule for a cloud call that may be throttled
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Calls allowed in total; 0 is treated as 1
    pub max_attempts: u32,
    /// Wait after the first failure
    pub initial_delay: Duration,
    /// Ceiling on any single wait
    pub max_delay: Duration,
    /// Growth factor applied per failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Give up once `attempts` calls have failed
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Self::default()
        }
    }

    /// Un-jittered wait following failed call number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(steps);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts.max(1)
    }
}

/// Scale a delay by a random factor in `[0.5, 1.5)` so that parallel
/// workers hitting the same throttle do not retry in lockstep.
fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    delay.mul_f64(factor)
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// the attempt budget in `config` runs out. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1u32;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_retry(&err) {
            warn!(op = operation_name, attempt, error = %err, "Permanent failure, not retrying");
            return Err(err);
        }
        if config.exhausted(attempt) {
            error!(op = operation_name, attempt, error = %err, "Retry budget exhausted");
            return Err(err);
        }

        let wait = jittered(config.delay_for_attempt(attempt));
        warn!(
            op = operation_name,
            attempt,
            error = %err,
            wait_ms = wait.as_millis() as u64,
            "Transient failure, backing off"
        );
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}

/// How the delay between polling attempts evolves
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay between every attempt
    #[default]
    Fixed,
    /// Delay doubles after every attempt, capped at `max_interval`
    Exponential,
}

/// Bounded polling configuration
#[derive(Clone, Debug, PartialEq)]
pub struct PollConfig {
    /// Number of probes before giving up (must be at least 1)
    pub max_attempts: u32,
    /// Delay after the first unsuccessful probe
    pub interval: Duration,
    /// Upper bound on the delay for exponential backoff
    pub max_interval: Duration,
    /// Delay growth strategy
    pub backoff: Backoff,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(5),
            backoff: Backoff::Fixed,
        }
    }
}

impl PollConfig {
    /// Fixed-interval polling
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            max_interval: interval,
            backoff: Backoff::Fixed,
        }
    }

    /// Exponential polling starting at `interval` and capped at `max_interval`
    pub fn exponential(max_attempts: u32, interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            max_interval,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay to wait after the given (1-based) unsuccessful attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let factor = 2f64.powi(attempt.saturating_sub(1).min(32) as i32);
                Duration::from_secs_f64(
                    (self.interval.as_secs_f64() * factor).min(self.max_interval.as_secs_f64()),
                )
            }
        }
    }
}

/// Result of a single polling probe
#[derive(Debug, PartialEq)]
pub enum Probe<T> {
    /// Terminal state reached
    Ready(T),
    /// Not there yet, probe again after the next delay
    Pending,
}

/// Why polling ended without a ready value
#[derive(Debug)]
pub enum PollError<E> {
    /// Every attempt reported [`Probe::Pending`]
    Exhausted {
        /// Number of probes made
        attempts: u32,
    },
    /// The probe itself failed
    Failed(E),
}

/// Probe until the probe reports [`Probe::Ready`], the probe fails, or the
/// attempt budget is exhausted.
///
/// A failing probe ends polling immediately; callers wanting to tolerate
/// transient probe errors map them to [`Probe::Pending`] inside the probe.
pub async fn poll_until<F, Fut, T, E>(
    config: &PollConfig,
    operation_name: &str,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match probe(attempt).await {
            Ok(Probe::Ready(value)) => return Ok(value),
            Ok(Probe::Pending) => {
                if attempt == max_attempts {
                    break;
                }
                let delay = config.delay_after(attempt);
                debug!(
                    op = operation_name,
                    attempt = attempt,
                    delay_ms = delay.as_millis(),
                    "Not ready yet, polling again"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(PollError::Failed(e)),
        }
    }

    warn!(
        op = operation_name,
        attempts = max_attempts,
        "Polling exhausted without reaching target state"
    );
    Err(PollError::Exhausted {
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    /// Fails with `Throttled` for the first `failures` calls, then returns
    /// the number of calls made.
    async fn throttled_then_ok(
        config: &RetryConfig,
        failures: u32,
        calls: Arc<AtomicU32>,
    ) -> Result<u32, String> {
        retry_with_backoff(config, "describe_instances", |_| true, || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(format!("Throttled ({n})"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
    }

    // ==========================================================================
    // retry_with_backoff
    // ==========================================================================

    #[tokio::test]
    async fn when_first_call_succeeds_no_retry_happens() {
        let calls = Arc::new(AtomicU32::new(0));
        let out = throttled_then_ok(&quick(4), 0, calls.clone()).await;
        assert_eq!(out, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn when_throttling_clears_the_call_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let out = throttled_then_ok(&quick(6), 3, calls.clone()).await;
        assert_eq!(out, Ok(4));
    }

    #[tokio::test]
    async fn when_budget_runs_out_the_last_error_is_returned() {
        let calls = Arc::new(AtomicU32::new(0));
        let out = throttled_then_ok(&quick(3), 10, calls.clone()).await;
        assert_eq!(out, Err("Throttled (3)".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn when_credentials_are_rejected_no_retry_happens() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let out: Result<(), &str> = retry_with_backoff(
            &quick(8),
            "run_instances",
            |e: &&str| !e.starts_with("AuthFailure"),
            || {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err("AuthFailure: bad key") }
            },
        )
        .await;
        assert_eq!(out, Err("AuthFailure: bad key"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn when_budget_is_zero_exactly_one_call_is_made() {
        let calls = Arc::new(AtomicU32::new(0));
        let out = throttled_then_ok(&quick(0), 10, calls.clone()).await;
        assert_eq!(out, Err("Throttled (1)".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn when_attempts_grow_retry_delay_doubles_up_to_the_ceiling() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(180),
            backoff_multiplier: 2.0,
        };
        let delays: Vec<u128> = (1..=4)
            .map(|a| config.delay_for_attempt(a).as_millis())
            .collect();
        assert_eq!(delays, vec![50, 100, 180, 180]);
    }

    // ==========================================================================
    // poll_until
    // ==========================================================================

    #[test]
    fn when_backoff_is_exponential_poll_delay_is_capped() {
        let config = PollConfig::exponential(
            10,
            Duration::from_millis(100),
            Duration::from_millis(350),
        );
        assert_eq!(config.delay_after(1), Duration::from_millis(100));
        assert_eq!(config.delay_after(2), Duration::from_millis(200));
        assert_eq!(config.delay_after(3), Duration::from_millis(350));
        assert_eq!(config.delay_after(9), Duration::from_millis(350));

        let fixed = PollConfig::fixed(3, Duration::from_millis(7));
        assert_eq!(fixed.delay_after(5), Duration::from_millis(7));
    }

    #[tokio::test]
    async fn when_instance_reaches_running_poll_returns_its_value() {
        let config = PollConfig::fixed(5, Duration::from_millis(1));
        let result: Result<&str, PollError<&str>> =
            poll_until(&config, "wait_running", |attempt| async move {
                Ok(if attempt < 3 {
                    Probe::Pending
                } else {
                    Probe::Ready("10.0.1.4")
                })
            })
            .await;
        assert!(matches!(result, Ok("10.0.1.4")));
    }

    #[tokio::test]
    async fn when_instance_never_settles_poll_reports_exhaustion() {
        let config = PollConfig::fixed(4, Duration::from_millis(1));
        let result: Result<(), PollError<&str>> =
            poll_until(&config, "wait_running", |_| async { Ok(Probe::Pending) }).await;
        assert!(matches!(result, Err(PollError::Exhausted { attempts: 4 })));
    }

    #[tokio::test]
    async fn when_probe_errors_polling_stops_at_once() {
        let probes = Arc::new(AtomicU32::new(0));
        let seen = probes.clone();
        let config = PollConfig::fixed(4, Duration::from_millis(1));
        let result: Result<(), PollError<&str>> = poll_until(&config, "wait_task", |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err("InvalidTaskId") }
        })
        .await;
        assert!(matches!(result, Err(PollError::Failed("InvalidTaskId"))));
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }
}
