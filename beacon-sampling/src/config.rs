use std::time::Duration;

use beacon_common::TelemetryKind;
use serde::{Deserialize, Serialize};

/// The way the sampling percentage is determined.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// All items are kept.
    #[default]
    Disabled,
    /// A constant, operator configured percentage.
    Fixed,
    /// A percentage adjusted to the observed item rate.
    Adaptive,
}

/// Configuration of the sampling engine.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// How the sampling percentage is determined.
    pub mode: SamplingMode,
    /// The percentage of items to keep in [`SamplingMode::Fixed`].
    pub percentage: f64,
    /// Item kinds that are never sampled.
    pub excluded_kinds: Vec<TelemetryKind>,
    /// Parameters of [`SamplingMode::Adaptive`].
    pub adaptive: AdaptiveSamplingConfig,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            mode: SamplingMode::Disabled,
            percentage: 100.0,
            excluded_kinds: Vec::new(),
            adaptive: AdaptiveSamplingConfig::default(),
        }
    }
}

impl SamplingConfig {
    /// Returns `true` if items of the given kind may be sampled.
    pub fn is_samplable_kind(&self, kind: TelemetryKind) -> bool {
        kind.is_samplable() && !self.excluded_kinds.contains(&kind)
    }
}

/// Parameters of the adaptive sampling controller.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdaptiveSamplingConfig {
    /// The number of kept items per second the controller aims for.
    pub max_items_per_second: f64,
    /// The percentage in effect before the first evaluation.
    pub initial_percentage: f64,
    /// Lower bound of the percentage.
    pub min_percentage: f64,
    /// Upper bound of the percentage.
    pub max_percentage: f64,
    /// Interval between evaluations in seconds.
    pub evaluation_interval: u64,
    /// Time in seconds after a change before the percentage may decrease.
    pub decrease_timeout: u64,
    /// Time in seconds after a change before the percentage may increase.
    pub increase_timeout: u64,
    /// Weight of the latest observation in the moving average of the item rate.
    pub moving_average_ratio: f64,
    /// Maximum factor by which the percentage changes in one evaluation.
    pub max_step_ratio: f64,
    /// Time in seconds after which an operation without new items is forgotten.
    pub operation_ttl: u64,
}

impl Default for AdaptiveSamplingConfig {
    fn default() -> Self {
        Self {
            max_items_per_second: 5.0,
            initial_percentage: 100.0,
            min_percentage: 0.1,
            max_percentage: 100.0,
            evaluation_interval: 15,
            decrease_timeout: 120,
            increase_timeout: 900,
            moving_average_ratio: 0.25,
            max_step_ratio: 2.0,
            operation_ttl: 300,
        }
    }
}

impl AdaptiveSamplingConfig {
    /// Returns the interval between evaluations.
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval.max(1))
    }

    /// Returns the hold time before the percentage may decrease.
    pub fn decrease_timeout(&self) -> Duration {
        Duration::from_secs(self.decrease_timeout)
    }

    /// Returns the hold time before the percentage may increase.
    pub fn increase_timeout(&self) -> Duration {
        Duration::from_secs(self.increase_timeout)
    }

    /// Returns the time after which an idle operation is forgotten.
    pub fn operation_ttl(&self) -> Duration {
        Duration::from_secs(self.operation_ttl)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_partial_config() {
        let json = r#"{
            "mode": "adaptive",
            "excluded_kinds": ["exception", "event"],
            "adaptive": {"max_items_per_second": 20.0, "evaluation_interval": 0}
        }"#;

        let config: SamplingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            SamplingConfig {
                mode: SamplingMode::Adaptive,
                excluded_kinds: vec![TelemetryKind::Exception, TelemetryKind::Event],
                adaptive: AdaptiveSamplingConfig {
                    max_items_per_second: 20.0,
                    evaluation_interval: 0,
                    ..Default::default()
                },
                ..Default::default()
            }
        );

        // A zero interval would busy loop the evaluation timer.
        assert_eq!(config.adaptive.evaluation_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_excluded_kind_is_not_samplable() {
        let config = SamplingConfig {
            excluded_kinds: vec![TelemetryKind::Request],
            ..Default::default()
        };

        assert!(!config.is_samplable_kind(TelemetryKind::Request));
        assert!(config.is_samplable_kind(TelemetryKind::Dependency));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result = serde_json::from_str::<SamplingConfig>(r#"{"mode": "sometimes"}"#);
        assert!(result.is_err());
    }
}
