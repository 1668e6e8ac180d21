use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use rand::Rng;

/// Backoff multiplier (2.0 doubles the interval on every step).
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// A stateful exponential backoff for consecutive failures of the same kind.
///
/// Every call to [`next_backoff`](Self::next_backoff) returns a longer interval until the maximum
/// is reached. The backoff is not randomized, so the sequence is reproducible.
#[derive(Debug)]
pub struct RetryBackoff {
    backoff: ExponentialBackoff,
    attempt: usize,
}

impl RetryBackoff {
    /// Creates a new backoff starting at `initial` and capped at `max_interval`.
    pub fn new(initial: Duration, max_interval: Duration) -> Self {
        let backoff = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            multiplier: DEFAULT_MULTIPLIER,
            randomization_factor: 0.0,
            max_interval: max_interval.max(initial),
            max_elapsed_time: None,
            ..Default::default()
        };

        RetryBackoff {
            backoff,
            attempt: 0,
        }
    }

    /// Resets this backoff to its initial state.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempt = 0;
    }

    /// Indicates whether a backoff attempt has started.
    pub fn started(&self) -> bool {
        self.attempt > 0
    }

    /// Returns the number of the current attempt.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Returns the next backoff duration.
    pub fn next_backoff(&mut self) -> Duration {
        self.attempt += 1;
        self.backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval)
    }
}

/// Delay computation for failed transmissions, based on their attempt count.
///
/// Unlike [`RetryBackoff`], this does not keep state. The attempt count travels with the
/// transmission, including through the overflow store, so the delay can be recomputed after a
/// restart.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_interval: Duration,
    /// Upper bound for all delays.
    pub max_interval: Duration,
    /// Relative randomization of every delay, in `[0, 0.5]`.
    pub jitter: f64,
    /// Number of failed attempts after which a transmission is dropped.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Returns `true` if a transmission that failed `attempt` times must not be retried.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Returns the delay before retrying a transmission that failed `attempt` times.
    ///
    /// The base delay doubles with every attempt and is capped at `max_interval`. The jitter is
    /// applied afterwards, and the result is capped again.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_interval.as_secs_f64() * DEFAULT_MULTIPLIER.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 0.5);
        let factor = if jitter > 0.0 {
            rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };

        Duration::from_secs_f64(capped * factor).min(self.max_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(600),
            jitter: 0.1,
            max_attempts: 10,
        }
    }
}

/// Error parsing a `Retry-After` header value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidRetryAfter;

impl fmt::Display for InvalidRetryAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid retry-after value")
    }
}

impl std::error::Error for InvalidRetryAfter {}

/// A delay requested by the endpoint before any further request may be sent.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct RetryAfter(Duration);

impl RetryAfter {
    /// Creates a retry after instruction with the given number of seconds.
    pub fn from_secs(seconds: u64) -> Self {
        Self(Duration::from_secs(seconds))
    }

    /// Creates a retry after instruction from a duration.
    pub fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    /// Returns the requested delay.
    pub fn duration(self) -> Duration {
        self.0
    }

    /// Parses a header value, accepting both delta seconds and an HTTP date.
    ///
    /// Dates are converted to a delay relative to `now`. Dates in the past yield a zero delay.
    pub fn parse(value: &str, now: DateTime<Utc>) -> Result<Self, InvalidRetryAfter> {
        let value = value.trim();
        if let Ok(retry_after) = value.parse() {
            return Ok(retry_after);
        }

        let date = DateTime::parse_from_rfc2822(value).map_err(|_| InvalidRetryAfter)?;
        let delay = (date.with_timezone(&Utc) - now).to_std().unwrap_or_default();
        Ok(Self(delay))
    }
}

impl FromStr for RetryAfter {
    type Err = InvalidRetryAfter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let float = s.trim().parse::<f64>().map_err(|_| InvalidRetryAfter)?;
        if !float.is_finite() {
            return Err(InvalidRetryAfter);
        }

        let seconds = float.max(0.0).ceil() as u64;
        Ok(RetryAfter::from_secs(seconds))
    }
}
