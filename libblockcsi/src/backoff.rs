//! Exponential backoff shared by every provider call.
//!
//! A [`BackoffPolicy`] is `(delay, factor, steps)`: at most `steps` attempts,
//! sleeping `delay` after the first failure and multiplying the sleep by
//! `factor` after each further one.  [`BackoffPolicy::retry`] re-runs an
//! operation while a caller-supplied predicate calls the error transient;
//! [`BackoffPolicy::poll_until`] re-checks a condition until it reports a
//! terminal value and yields [`CloudError::Timeout`] otherwise.
//!
//! Environment overrides:
//! - `BACKOFF_DURATION`: initial delay, `"1s"`, `"500ms"`, `"2m"` or bare
//!   seconds.  Defaults to 1s.
//! - `BACKOFF_FACTOR`: multiplier, a float `>= 1`.  Defaults to 2.
//! - `BACKOFF_STEPS`: attempt count, an integer `>= 1`.  Defaults to 5.
//!
//! Unset or unparsable values fall back to the default silently.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cloud::CloudError;

pub const ENV_BACKOFF_DURATION: &str = "BACKOFF_DURATION";
pub const ENV_BACKOFF_FACTOR: &str = "BACKOFF_FACTOR";
pub const ENV_BACKOFF_STEPS: &str = "BACKOFF_STEPS";

pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_FACTOR: f64 = 2.0;
pub const DEFAULT_STEPS: u32 = 5;

/// Upper bound on a single sleep.
const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub delay: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            factor: DEFAULT_FACTOR,
            steps: DEFAULT_STEPS,
        }
    }
}

impl BackoffPolicy {
    pub fn new(delay: Duration, factor: f64, steps: u32) -> Self {
        Self {
            delay,
            factor,
            steps,
        }
    }

    /// Read the policy from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the policy through an arbitrary lookup, one value per setting.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let delay = lookup(ENV_BACKOFF_DURATION)
            .and_then(|v| parse_duration(&v))
            .unwrap_or(DEFAULT_DELAY);
        let factor = lookup(ENV_BACKOFF_FACTOR)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|f| f.is_finite() && *f >= 1.0)
            .unwrap_or(DEFAULT_FACTOR);
        let steps = lookup(ENV_BACKOFF_STEPS)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|s| *s >= 1)
            .unwrap_or(DEFAULT_STEPS);
        Self {
            delay,
            factor,
            steps,
        }
    }

    /// Sleep durations between consecutive attempts (`steps - 1` values).
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let factor = self.factor;
        let first = self.delay.min(MAX_DELAY);
        std::iter::successors(Some(first), move |d| {
            Some(
                Duration::try_from_secs_f64(d.as_secs_f64() * factor)
                    .unwrap_or(MAX_DELAY)
                    .min(MAX_DELAY),
            )
        })
        .take(self.steps.saturating_sub(1) as usize)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up.  The last error is returned unchanged.
    pub async fn retry<T, E, F, Fut, P>(&self, what: &str, is_transient: P, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut delays = self.delays();
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) => match delays.next() {
                    Some(delay) => {
                        debug!(what, attempt, ?delay, error = %e, "transient failure, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(what, attempt, error = %e, "retries exhausted");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Evaluate `check` until it yields `Some`, sleeping between attempts.
    ///
    /// Transient errors from `check` count as "not yet"; any other error is
    /// returned at once.  Running out of attempts yields
    /// [`CloudError::Timeout`].
    pub async fn poll_until<T, F, Fut>(&self, what: &str, mut check: F) -> Result<T, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, CloudError>>,
    {
        let mut delays = self.delays();
        loop {
            match check().await {
                Ok(Some(v)) => return Ok(v),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    debug!(what, error = %e, "transient failure while polling");
                }
                Err(e) => return Err(e),
            }
            match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(CloudError::Timeout(what.to_owned())),
            }
        }
    }
}

/// Parse `"1s"`, `"250ms"`, `"1.5s"`, `"2m"`, `"1h"`, or bare seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = s.split_at(split);
    let value: f64 = num.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = match unit {
        "ns" => value / 1e9,
        "us" | "µs" => value / 1e6,
        "ms" => value / 1e3,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn quick(steps: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), 1.0, steps)
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(BackoffPolicy::from_lookup(lookup(&[])), BackoffPolicy::default());
    }

    #[test]
    fn reads_all_three_values() {
        let policy = BackoffPolicy::from_lookup(lookup(&[
            (ENV_BACKOFF_DURATION, "500ms"),
            (ENV_BACKOFF_FACTOR, "1.5"),
            (ENV_BACKOFF_STEPS, "8"),
        ]));
        assert_eq!(policy, BackoffPolicy::new(Duration::from_millis(500), 1.5, 8));

        let bare = BackoffPolicy::from_lookup(lookup(&[(ENV_BACKOFF_DURATION, "3")]));
        assert_eq!(bare.delay, Duration::from_secs(3));
    }

    #[test]
    fn unparsable_values_fall_back_independently() {
        let policy = BackoffPolicy::from_lookup(lookup(&[
            (ENV_BACKOFF_DURATION, "soon"),
            (ENV_BACKOFF_FACTOR, "0.5"),
            (ENV_BACKOFF_STEPS, "12"),
        ]));
        assert_eq!(policy.delay, DEFAULT_DELAY);
        assert_eq!(policy.factor, DEFAULT_FACTOR);
        assert_eq!(policy.steps, 12);

        let policy = BackoffPolicy::from_lookup(lookup(&[
            (ENV_BACKOFF_FACTOR, "NaN"),
            (ENV_BACKOFF_STEPS, "-1"),
        ]));
        assert_eq!(policy.factor, DEFAULT_FACTOR);
        assert_eq!(policy.steps, DEFAULT_STEPS);
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("5 days"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn delays_grow_by_factor() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, 4);
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test]
    async fn retry_stops_at_steps() {
        let calls = AtomicU32::new(0);
        let result: Result<(), CloudError> = quick(3)
            .retry("op", CloudError::is_transient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CloudError::Network("reset".into()))
            })
            .await;
        assert!(matches!(result, Err(CloudError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_client_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), CloudError> = quick(5)
            .retry("op", CloudError::is_transient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CloudError::NotFound("vol-1".into()))
            })
            .await;
        assert!(matches!(result, Err(CloudError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient() {
        let calls = AtomicU32::new(0);
        let result = quick(5)
            .retry("op", CloudError::is_transient, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CloudError::api(503, "ServiceUnavailable", "try later"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_times_out() {
        let calls = AtomicU32::new(0);
        let result: Result<(), CloudError> = quick(4)
            .poll_until("attachment", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await;
        assert!(matches!(result, Err(CloudError::Timeout(ref w)) if w == "attachment"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn poll_returns_terminal_value() {
        let calls = AtomicU32::new(0);
        let result = quick(5)
            .poll_until("state", || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(CloudError::api(429, "RequestLimitExceeded", "slow down")),
                    1 => Ok(None),
                    _ => Ok(Some("attached")),
                }
            })
            .await;
        assert_eq!(result.unwrap(), "attached");
    }
}
