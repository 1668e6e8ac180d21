use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use beacon_common::TelemetryKind;
use beacon_config::{Config, HttpEncoding};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::codec;
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink};
use crate::http::{Transport, TransportError, TransportRequest, TransportResponse};
use crate::item::TelemetryItem;

/// A scripted response of the [`MockTransport`].
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: Bytes,
    pub delay: Option<Duration>,
    pub panic: bool,
}

impl MockResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: Bytes::new(),
            delay: None,
            panic: false,
        }
    }

    /// Makes the transport panic instead of responding.
    pub fn panic() -> Self {
        Self {
            panic: true,
            ..Self::status(500)
        }
    }

    pub fn retry_after(mut self, value: &str) -> Self {
        self.retry_after = Some(value.to_owned());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = serde_json::to_vec(&body).unwrap().into();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A request received by the [`MockTransport`].
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub at: Instant,
    pub lines: Vec<Value>,
}

impl RecordedRequest {
    /// Returns the `name` of every event in the payload.
    pub fn names(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|line| line["data"]["baseData"]["name"].as_str())
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Debug, Default)]
struct MockState {
    responses: VecDeque<MockResponse>,
    requests: Vec<RecordedRequest>,
}

/// A transport answering with scripted responses, and `200` once the script is exhausted.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(responses: impl IntoIterator<Item = MockResponse>) -> Self {
        let transport = Self::default();
        transport.state.lock().responses.extend(responses);
        transport
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Waits until at least `count` requests were received.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<RecordedRequest> {
        loop {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let encoding = match request.content_encoding {
            Some(_) => HttpEncoding::Gzip,
            None => HttpEncoding::Identity,
        };
        let decoded = codec::decode(&request.body, encoding).unwrap();
        let lines = codec::split_lines(&decoded)
            .into_iter()
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect();

        let response = {
            let mut state = self.state.lock();
            state.requests.push(RecordedRequest {
                at: Instant::now(),
                lines,
            });
            state
                .responses
                .pop_front()
                .unwrap_or_else(|| MockResponse::status(200))
        };

        if response.panic {
            panic!("transport failed");
        }

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(TransportResponse {
            status: response.status,
            retry_after: response.retry_after,
            body: response.body,
        })
    }
}

/// A diagnostics sink remembering all events.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.name()).collect()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn emit(&self, event: &DiagnosticEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Creates a config storing records in `dir`, without compression or retry jitter.
///
/// Periodic flushing and draining are pushed out of the way, so tests control every dispatch.
/// `overrides` are merged into the top-level sections.
pub fn test_config(dir: &Path, overrides: Value) -> Arc<Config> {
    let mut value = json!({
        "endpoint": {"url": "http://localhost:8080/v2/track"},
        "buffer": {"flush_interval": 3600},
        "http": {"encoding": "identity", "timeout": 30},
        "retry": {"jitter": 0.0, "initial_interval": 10_000},
        "storage": {"path": dir, "drain_interval": 3600},
    });

    if let (Some(base), Value::Object(overrides)) = (value.as_object_mut(), overrides) {
        for (section, fields) in overrides {
            let entry = base.entry(section).or_insert_with(|| json!({}));
            match (entry.as_object_mut(), fields) {
                (Some(entry), Value::Object(fields)) => entry.extend(fields),
                (_, fields) => *entry = fields,
            }
        }
    }

    Arc::new(Config::from_json_value(value).unwrap())
}

/// Creates an event item with the given name.
pub fn event(name: &str) -> TelemetryItem {
    TelemetryItem::new(TelemetryKind::Event, json!({"name": name}))
}
