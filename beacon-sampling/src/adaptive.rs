use std::time::{Duration, Instant};

use crate::config::AdaptiveSamplingConfig;
use crate::evaluation::round_to_ratio;

/// A change of the sampling percentage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateChange {
    /// The percentage before the change.
    pub previous: f64,
    /// The percentage after the change.
    pub current: f64,
}

/// Computes the sampling percentage from the observed item rate.
///
/// The controller keeps an exponential moving average of the number of samplable items per
/// second seen before sampling. From that estimate, it derives the percentage at which the kept
/// rate would match the configured target. Changes are limited in size by
/// `max_step_ratio`, rounded down to `100 / n`, and clamped to the configured bounds.
///
/// After every change, the percentage is held for `decrease_timeout` before it may drop further
/// and for `increase_timeout` before it may grow again.
#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveSamplingConfig,
    current: f64,
    average: Option<f64>,
    last_evaluation: Instant,
    last_change: Instant,
}

impl AdaptiveController {
    /// Creates a controller starting at the initial percentage.
    pub fn new(config: AdaptiveSamplingConfig, now: Instant) -> Self {
        let current = config
            .initial_percentage
            .clamp(config.min_percentage, config.max_percentage);

        Self {
            config,
            current,
            average: None,
            last_evaluation: now,
            last_change: now,
        }
    }

    /// Returns the percentage in effect.
    pub fn percentage(&self) -> f64 {
        self.current
    }

    /// Returns the moving average of samplable items per second, if any were observed.
    pub fn average_rate(&self) -> Option<f64> {
        self.average
    }

    /// Feeds the number of samplable items observed since the last evaluation.
    ///
    /// Returns the change if the percentage was adjusted.
    pub fn evaluate(&mut self, observed: u64, now: Instant) -> Option<RateChange> {
        let elapsed = now.saturating_duration_since(self.last_evaluation);
        if elapsed.is_zero() {
            return None;
        }
        self.last_evaluation = now;

        let rate = observed as f64 / elapsed.as_secs_f64();
        let ratio = self.config.moving_average_ratio.clamp(0.0, 1.0);
        let average = match self.average {
            Some(average) => ratio * rate + (1.0 - ratio) * average,
            None => rate,
        };
        self.average = Some(average);

        let suggested = self.suggest(average);
        let since_change = now.saturating_duration_since(self.last_change);

        let allowed = if suggested < self.current {
            since_change >= self.config.decrease_timeout()
        } else if suggested > self.current {
            since_change >= self.config.increase_timeout()
        } else {
            false
        };

        beacon_log::trace!(
            rate,
            average,
            suggested,
            current = self.current,
            allowed,
            "evaluated adaptive sampling"
        );

        if !allowed {
            return None;
        }

        let change = RateChange {
            previous: self.current,
            current: suggested,
        };

        self.current = suggested;
        self.last_change = now;
        Some(change)
    }

    fn suggest(&self, average: f64) -> f64 {
        let config = &self.config;

        let target = if average > 0.0 {
            100.0 * config.max_items_per_second / average
        } else {
            config.max_percentage
        };

        let step = config.max_step_ratio.max(1.0);
        let limited = target.clamp(self.current / step, self.current * step);

        round_to_ratio(limited).clamp(config.min_percentage, config.max_percentage)
    }

    /// Returns the time until the next evaluation is due.
    pub fn next_evaluation(&self, now: Instant) -> Duration {
        (self.last_evaluation + self.config.evaluation_interval()).saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AdaptiveSamplingConfig {
        AdaptiveSamplingConfig {
            max_items_per_second: 5.0,
            decrease_timeout: 0,
            increase_timeout: 0,
            moving_average_ratio: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_converges_in_steps() {
        let start = Instant::now();
        let mut controller = AdaptiveController::new(config(), start);
        assert_eq!(controller.percentage(), 100.0);

        // 50 items per second against a target of 5 needs 10%.
        let mut percentages = vec![];
        for i in 1..=6 {
            let now = start + Duration::from_secs(10 * i);
            if let Some(change) = controller.evaluate(500, now) {
                percentages.push(change.current);
            }
        }

        assert_eq!(percentages, [50.0, 25.0, 12.5, 10.0]);
        assert_eq!(controller.average_rate(), Some(50.0));
    }

    #[test]
    fn test_decrease_timeout_holds() {
        let start = Instant::now();
        let mut controller = AdaptiveController::new(
            AdaptiveSamplingConfig {
                decrease_timeout: 120,
                ..config()
            },
            start,
        );

        assert_eq!(controller.evaluate(500, start + Duration::from_secs(15)), None);
        assert_eq!(controller.percentage(), 100.0);

        let change = controller.evaluate(1200, start + Duration::from_secs(120));
        assert_eq!(
            change,
            Some(RateChange {
                previous: 100.0,
                current: 50.0
            })
        );
    }

    #[test]
    fn test_increase_timeout_holds() {
        let start = Instant::now();
        let mut controller = AdaptiveController::new(
            AdaptiveSamplingConfig {
                initial_percentage: 10.0,
                increase_timeout: 900,
                ..config()
            },
            start,
        );

        // Traffic stops entirely: the percentage may only grow after the increase timeout.
        assert_eq!(controller.evaluate(0, start + Duration::from_secs(60)), None);
        let change = controller.evaluate(0, start + Duration::from_secs(900));
        assert_eq!(change.map(|c| c.current), Some(20.0));
    }

    #[test]
    fn test_clamped_to_bounds() {
        let start = Instant::now();
        let mut controller = AdaptiveController::new(
            AdaptiveSamplingConfig {
                min_percentage: 20.0,
                max_step_ratio: 100.0,
                ..config()
            },
            start,
        );

        let change = controller.evaluate(100_000, start + Duration::from_secs(1));
        assert_eq!(change.map(|c| c.current), Some(20.0));
    }

    #[test]
    fn test_zero_elapsed_is_ignored() {
        let start = Instant::now();
        let mut controller = AdaptiveController::new(config(), start);
        assert_eq!(controller.evaluate(1000, start), None);
        assert_eq!(controller.average_rate(), None);
    }
}
