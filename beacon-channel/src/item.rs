use std::collections::BTreeMap;

use beacon_common::TelemetryKind;
use beacon_sampling::Samplable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Fixed size accounted for every item on top of its contents.
const ITEM_OVERHEAD: usize = 256;

/// A single observation submitted by the application.
///
/// The channel treats the payload in `data` as opaque. Besides the kind and timestamp, it only
/// inspects the correlation id for sampling and records the applied sampling percentage in
/// `sample_rate`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TelemetryItem {
    /// Unique identity of the item.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// The type of observation.
    pub kind: TelemetryKind,
    /// Wall clock time at which the observation was made.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Identifier shared by all items of one logical operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Custom properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// The sampling percentage this item represents, if it was sampled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    /// Set to `false` to exempt this item from sampling, for instance for health checks.
    #[serde(default = "default_samplable")]
    pub samplable: bool,
    /// The kind specific payload.
    #[serde(default)]
    pub data: Value,
}

fn default_samplable() -> bool {
    true
}

impl TelemetryItem {
    /// Creates a new item observed now.
    pub fn new(kind: TelemetryKind, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            correlation_id: None,
            properties: BTreeMap::new(),
            sample_rate: None,
            samplable: true,
            data,
        }
    }

    /// Assigns the item to an operation.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Adds a custom property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Brings the item into canonical form before it enters the buffer.
    ///
    /// Empty correlation ids are treated as absent.
    pub fn normalize(&mut self) {
        if self.correlation_id.as_deref().is_some_and(str::is_empty) {
            self.correlation_id = None;
        }
    }

    /// Returns a cheap estimate of the serialized size of this item.
    pub fn estimated_size(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len() + 6)
            .sum();

        ITEM_OVERHEAD
            + self.correlation_id.as_ref().map_or(0, String::len)
            + properties
            + estimate_value(&self.data)
    }
}

fn estimate_value(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 5,
        Value::Number(_) => 20,
        Value::String(s) => s.len() + 2,
        Value::Array(values) => values.iter().map(|v| estimate_value(v) + 1).sum::<usize>() + 2,
        Value::Object(map) => {
            map.iter()
                .map(|(k, v)| k.len() + 4 + estimate_value(v))
                .sum::<usize>()
                + 2
        }
    }
}

impl Samplable for TelemetryItem {
    fn kind(&self) -> TelemetryKind {
        self.kind
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn identity(&self) -> Uuid {
        self.id
    }

    fn is_samplable(&self) -> bool {
        self.samplable
    }

    fn sample_rate(&self) -> Option<f64> {
        self.sample_rate
    }

    fn set_sample_rate(&mut self, percentage: f64) {
        self.sample_rate = Some(percentage);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_minimal() {
        let item: TelemetryItem = serde_json::from_str(r#"{"kind": "trace"}"#).unwrap();
        assert_eq!(item.kind, TelemetryKind::Trace);
        assert!(item.samplable);
        assert_eq!(item.data, Value::Null);
    }

    #[test]
    fn test_normalize_empty_correlation_id() {
        let mut item = TelemetryItem::new(TelemetryKind::Request, json!({})).with_correlation_id("");
        item.normalize();
        assert_eq!(item.correlation_id, None);
    }

    #[test]
    fn test_estimated_size_grows_with_payload() {
        let small = TelemetryItem::new(TelemetryKind::Trace, json!({"message": "hi"}));
        let large = TelemetryItem::new(TelemetryKind::Trace, json!({"message": "x".repeat(1000)}));
        assert!(large.estimated_size() > small.estimated_size() + 990);
    }
}
