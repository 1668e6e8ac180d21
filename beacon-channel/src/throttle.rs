use std::time::Duration;

use beacon_common::{RetryAfter, RetryBackoff};
use tokio::time::Instant;

/// Upper bound for any pause, regardless of configuration.
const MAX_PAUSE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Global pause of all transmissions after the endpoint signaled throttling.
///
/// While blocked, no new request is started. If the endpoint does not say how long to wait, the
/// pause grows exponentially with consecutive throttling responses. A successful transmission
/// resets the backoff.
#[derive(Debug)]
pub struct ThrottleState {
    blocked_until: Option<Instant>,
    backoff: RetryBackoff,
    max_delay: Duration,
}

impl ThrottleState {
    /// Creates an unblocked state.
    pub fn new(default_delay: Duration, max_delay: Duration) -> Self {
        Self {
            blocked_until: None,
            backoff: RetryBackoff::new(default_delay, max_delay),
            max_delay: max_delay.min(MAX_PAUSE),
        }
    }

    /// Returns `true` if transmissions must not start at `now`.
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    /// Returns the end of the current pause, if any.
    pub fn blocked_until(&self) -> Option<Instant> {
        self.blocked_until
    }

    /// Registers a throttling response and returns the length of the resulting pause.
    ///
    /// An existing pause is never shortened. Pauses requested by the endpoint are capped at the
    /// maximum delay.
    pub fn throttle(&mut self, retry_after: Option<RetryAfter>, now: Instant) -> Duration {
        let delay = match retry_after {
            Some(retry_after) => retry_after.duration(),
            None => self.backoff.next_backoff(),
        }
        .min(self.max_delay);

        let until = now + delay;
        let until = self.blocked_until.map_or(until, |current| current.max(until));
        self.blocked_until = Some(until);
        until - now
    }

    /// Clears the backoff after a successful transmission.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.blocked_until = None;
    }
}
