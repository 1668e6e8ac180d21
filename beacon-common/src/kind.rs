use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The type of a telemetry item.
///
/// The kind decides the envelope name and data type on the wire, and whether an item may be
/// sampled at all.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    /// An incoming request handled by the application.
    Request,
    /// An outgoing call to a remote dependency.
    Dependency,
    /// A handled or unhandled exception.
    Exception,
    /// A diagnostic log message.
    Trace,
    /// A named custom event.
    Event,
    /// A pre-aggregated or single metric value.
    Metric,
    /// A page view reported by a browser.
    PageView,
    /// The result of an availability test.
    Availability,
}

impl TelemetryKind {
    /// Returns the lowercase name of this kind, as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Dependency => "dependency",
            Self::Exception => "exception",
            Self::Trace => "trace",
            Self::Event => "event",
            Self::Metric => "metric",
            Self::PageView => "pageview",
            Self::Availability => "availability",
        }
    }

    /// Returns the name of the envelope carrying items of this kind.
    pub fn envelope_name(self) -> &'static str {
        match self {
            Self::Request => "Microsoft.ApplicationInsights.Request",
            Self::Dependency => "Microsoft.ApplicationInsights.RemoteDependency",
            Self::Exception => "Microsoft.ApplicationInsights.Exception",
            Self::Trace => "Microsoft.ApplicationInsights.Message",
            Self::Event => "Microsoft.ApplicationInsights.Event",
            Self::Metric => "Microsoft.ApplicationInsights.Metric",
            Self::PageView => "Microsoft.ApplicationInsights.PageView",
            Self::Availability => "Microsoft.ApplicationInsights.Availability",
        }
    }

    /// Returns the data type name written to `data.baseType`.
    pub fn base_type(self) -> &'static str {
        match self {
            Self::Request => "RequestData",
            Self::Dependency => "RemoteDependencyData",
            Self::Exception => "ExceptionData",
            Self::Trace => "MessageData",
            Self::Event => "EventData",
            Self::Metric => "MetricData",
            Self::PageView => "PageViewData",
            Self::Availability => "AvailabilityData",
        }
    }

    /// Returns `true` if items of this kind may ever be dropped by sampling.
    ///
    /// Metrics are pre-aggregated on the client and are never sampled.
    pub fn is_samplable(self) -> bool {
        !matches!(self, Self::Metric)
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`TelemetryKind`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseTelemetryKindError;

impl fmt::Display for ParseTelemetryKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown telemetry kind")
    }
}

impl std::error::Error for ParseTelemetryKindError {}

impl FromStr for TelemetryKind {
    type Err = ParseTelemetryKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "request" => Self::Request,
            "dependency" => Self::Dependency,
            "exception" => Self::Exception,
            "trace" => Self::Trace,
            "event" => Self::Event,
            "metric" => Self::Metric,
            "pageview" => Self::PageView,
            "availability" => Self::Availability,
            _ => return Err(ParseTelemetryKindError),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches_serde() {
        for kind in [
            TelemetryKind::Request,
            TelemetryKind::Dependency,
            TelemetryKind::PageView,
            TelemetryKind::Metric,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
            assert_eq!(kind.as_str().parse::<TelemetryKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(
            "span".parse::<TelemetryKind>(),
            Err(ParseTelemetryKindError)
        );
    }

    #[test]
    fn test_metrics_not_samplable() {
        assert!(!TelemetryKind::Metric.is_samplable());
        assert!(TelemetryKind::Request.is_samplable());
    }
}
