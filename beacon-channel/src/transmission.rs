use std::fmt;
use std::time::Duration;

use beacon_common::{RetryAfter, UnixTimestamp};
use beacon_config::HttpEncoding;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use url::Url;

use crate::codec::{self, CONTENT_TYPE, CodecError, Serializer};
use crate::http::{Transport, TransportError, TransportRequest, TransportResponse};
use crate::item::TelemetryItem;
use crate::store::{ClaimedRecord, RecordHeader, RecordId};

/// Status codes of individual items in a partial success response that are worth retrying.
const RETRYABLE_ITEM_STATUS: &[u16] = &[408, 429, 439, 500, 502, 503, 504];

/// The reason a transmission failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureReason {
    /// The request timed out.
    Timeout,
    /// The request could not be sent.
    Network(String),
    /// The endpoint responded with an error status.
    Status(u16),
    /// The endpoint rejected individual items of the payload.
    Rejected,
    /// The payload could not be encoded or decoded.
    Payload(String),
    /// The unit could not be written to the overflow store.
    Storage(String),
    /// The task sending the unit failed.
    Aborted(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Network(error) => write!(f, "network error: {error}"),
            Self::Status(status) => write!(f, "status {status}"),
            Self::Rejected => f.write_str("rejected by endpoint"),
            Self::Payload(error) => write!(f, "invalid payload: {error}"),
            Self::Storage(error) => write!(f, "storage error: {error}"),
            Self::Aborted(error) => write!(f, "transmission aborted: {error}"),
        }
    }
}

/// The classified result of a send attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum SendOutcome {
    /// All items were accepted.
    Success,
    /// Some items were rejected.
    PartialSuccess {
        /// Line indexes of items rejected with a retryable status.
        retry: Vec<usize>,
        /// Number of items rejected permanently.
        rejected: usize,
    },
    /// The attempt failed but may succeed later.
    RetryableFailure(FailureReason),
    /// The endpoint rejected the payload. It must not be sent again.
    NonRetryableFailure(FailureReason),
    /// The payload exceeds the size accepted by the endpoint.
    PayloadTooLarge,
    /// The endpoint asks the client to pause all requests.
    Throttled(Option<RetryAfter>),
}

impl SendOutcome {
    /// Returns a short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess { .. } => "partial_success",
            Self::RetryableFailure(_) => "retryable_failure",
            Self::NonRetryableFailure(_) => "permanent_failure",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Throttled(_) => "throttled",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackResponse {
    #[serde(default)]
    errors: Vec<TrackError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackError {
    index: usize,
    status_code: u16,
}

/// Classifies the result of a request.
pub fn classify(result: Result<TransportResponse, TransportError>) -> SendOutcome {
    let response = match result {
        Ok(response) => response,
        Err(error) if error.is_timeout() => {
            return SendOutcome::RetryableFailure(FailureReason::Timeout);
        }
        Err(TransportError::SendFailed(error)) => {
            return SendOutcome::RetryableFailure(FailureReason::Network(error.to_string()));
        }
        Err(TransportError::Timeout) => {
            return SendOutcome::RetryableFailure(FailureReason::Timeout);
        }
    };

    let retry_after = response
        .retry_after
        .as_deref()
        .and_then(|value| RetryAfter::parse(value, Utc::now()).ok());

    match response.status {
        206 => classify_partial(&response.body),
        200..=299 => SendOutcome::Success,
        429 | 439 => SendOutcome::Throttled(retry_after),
        503 if retry_after.is_some() => SendOutcome::Throttled(retry_after),
        413 => SendOutcome::PayloadTooLarge,
        408 | 500..=599 => SendOutcome::RetryableFailure(FailureReason::Status(response.status)),
        status => SendOutcome::NonRetryableFailure(FailureReason::Status(status)),
    }
}

fn classify_partial(body: &[u8]) -> SendOutcome {
    let response: TrackResponse = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(error) => {
            beacon_log::debug!(
                error = &error as &dyn std::error::Error,
                "unparseable partial success response"
            );
            return SendOutcome::Success;
        }
    };

    let mut retry = Vec::new();
    let mut rejected = 0;
    for error in response.errors {
        if RETRYABLE_ITEM_STATUS.contains(&error.status_code) {
            retry.push(error.index);
        } else {
            rejected += 1;
        }
    }

    if retry.is_empty() && rejected == 0 {
        return SendOutcome::Success;
    }

    retry.sort_unstable();
    retry.dedup();
    SendOutcome::PartialSuccess { retry, rejected }
}

/// One outbound delivery of a serialized batch.
///
/// A unit is created from a sampled batch or loaded from the overflow store. It carries its
/// retry state with it: the number of failed attempts and, once persisted, the id of its record.
#[derive(Clone, Debug)]
pub struct TransmissionUnit {
    payload: Bytes,
    encoding: HttpEncoding,
    item_count: usize,
    /// Number of failed attempts so far.
    pub attempt: u32,
    created: UnixTimestamp,
    /// The record backing this unit in the overflow store.
    pub record: Option<RecordId>,
    /// Classification of the most recent failure.
    pub last_failure: Option<FailureReason>,
}

impl TransmissionUnit {
    /// Serializes and encodes a batch.
    pub fn from_items(
        items: &[TelemetryItem],
        serializer: &dyn Serializer,
        encoding: HttpEncoding,
    ) -> Result<Self, CodecError> {
        let payload = codec::encode(&serializer.serialize(items)?, encoding)?;
        Ok(Self::from_payload(payload.into(), encoding, items.len()))
    }

    /// Creates a unit from an encoded payload.
    pub fn from_payload(payload: Bytes, encoding: HttpEncoding, item_count: usize) -> Self {
        Self {
            payload,
            encoding,
            item_count,
            attempt: 0,
            created: UnixTimestamp::now(),
            record: None,
            last_failure: None,
        }
    }

    /// Restores a unit claimed from the overflow store.
    pub fn from_record(record: ClaimedRecord) -> Self {
        Self {
            payload: record.payload,
            encoding: record.header.encoding,
            item_count: record.header.item_count as usize,
            attempt: record.header.attempt,
            created: record.header.created,
            record: Some(record.id),
            last_failure: None,
        }
    }

    /// Returns the header written to the overflow store for this unit.
    pub fn record_header(&self) -> RecordHeader {
        RecordHeader {
            encoding: self.encoding,
            item_count: self.item_count.try_into().unwrap_or(u32::MAX),
            attempt: self.attempt,
            created: self.created,
        }
    }

    /// Returns the encoded payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the number of items in the payload.
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Returns the time the batch was created.
    pub fn created(&self) -> UnixTimestamp {
        self.created
    }

    /// Builds the request delivering this unit.
    pub fn request(&self, url: &Url) -> TransportRequest {
        TransportRequest {
            url: url.clone(),
            body: self.payload.clone(),
            content_type: CONTENT_TYPE,
            content_encoding: self.encoding.name(),
        }
    }

    /// Sends the unit once and classifies the result.
    pub async fn send<T: Transport>(
        &self,
        transport: &T,
        url: &Url,
        timeout: Duration,
    ) -> SendOutcome {
        let result = match tokio::time::timeout(timeout, transport.send(self.request(url))).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        classify(result)
    }

    fn derive(&self, lines: &[&[u8]]) -> Result<Self, CodecError> {
        let payload = codec::encode(&codec::join_lines(lines), self.encoding)?;
        Ok(Self {
            payload: payload.into(),
            encoding: self.encoding,
            item_count: lines.len(),
            attempt: self.attempt,
            created: self.created,
            record: None,
            last_failure: None,
        })
    }

    /// Splits the unit into two halves.
    ///
    /// Returns `None` if the unit contains a single item and cannot be split further. The halves
    /// are not backed by a record.
    pub fn split(&self) -> Result<Option<(Self, Self)>, CodecError> {
        let decoded = codec::decode(&self.payload, self.encoding)?;
        let lines = codec::split_lines(&decoded);
        if lines.len() < 2 {
            return Ok(None);
        }

        let (left, right) = lines.split_at(lines.len() / 2);
        Ok(Some((self.derive(left)?, self.derive(right)?)))
    }

    /// Creates a unit with the items at the given line indexes.
    ///
    /// Indexes out of range are ignored. Returns `None` if no index matches.
    pub fn select(&self, indexes: &[usize]) -> Result<Option<Self>, CodecError> {
        let decoded = codec::decode(&self.payload, self.encoding)?;
        let lines = codec::split_lines(&decoded);
        let selected: Vec<&[u8]> = indexes
            .iter()
            .filter_map(|&index| lines.get(index).copied())
            .collect();

        if selected.is_empty() {
            return Ok(None);
        }

        self.derive(&selected).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use beacon_common::TelemetryKind;
    use serde_json::json;

    use super::*;
    use crate::codec::JsonLinesSerializer;

    fn response(status: u16) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status,
            ..Default::default()
        })
    }

    fn unit(count: usize, encoding: HttpEncoding) -> TransmissionUnit {
        let items: Vec<_> = (0..count)
            .map(|i| TelemetryItem::new(TelemetryKind::Event, json!({"name": format!("e{i}")})))
            .collect();
        TransmissionUnit::from_items(&items, &JsonLinesSerializer::default(), encoding).unwrap()
    }

    fn names(unit: &TransmissionUnit) -> Vec<String> {
        let decoded = codec::decode(unit.payload(), unit.encoding).unwrap();
        codec::split_lines(&decoded)
            .into_iter()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_slice(line).unwrap();
                value["data"]["baseData"]["name"].as_str().unwrap().to_owned()
            })
            .collect()
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify(response(200)), SendOutcome::Success);
        assert_eq!(classify(response(204)), SendOutcome::Success);
        assert_eq!(classify(response(413)), SendOutcome::PayloadTooLarge);
        assert_eq!(classify(response(429)), SendOutcome::Throttled(None));
        assert_eq!(classify(response(439)), SendOutcome::Throttled(None));
        assert_eq!(
            classify(response(500)),
            SendOutcome::RetryableFailure(FailureReason::Status(500))
        );
        assert_eq!(
            classify(response(503)),
            SendOutcome::RetryableFailure(FailureReason::Status(503))
        );
        assert_eq!(
            classify(response(408)),
            SendOutcome::RetryableFailure(FailureReason::Status(408))
        );
        assert_eq!(
            classify(response(400)),
            SendOutcome::NonRetryableFailure(FailureReason::Status(400))
        );
        assert_eq!(
            classify(response(302)),
            SendOutcome::NonRetryableFailure(FailureReason::Status(302))
        );
    }

    #[test]
    fn test_classify_retry_after() {
        let throttled = classify(Ok(TransportResponse {
            status: 429,
            retry_after: Some("30".to_owned()),
            ..Default::default()
        }));
        assert_eq!(throttled, SendOutcome::Throttled(Some(RetryAfter::from_secs(30))));

        let unavailable = classify(Ok(TransportResponse {
            status: 503,
            retry_after: Some("120".to_owned()),
            ..Default::default()
        }));
        assert_eq!(
            unavailable,
            SendOutcome::Throttled(Some(RetryAfter::from_secs(120)))
        );
    }

    #[test]
    fn test_classify_timeout() {
        assert_eq!(
            classify(Err(TransportError::Timeout)),
            SendOutcome::RetryableFailure(FailureReason::Timeout)
        );
    }

    #[test]
    fn test_classify_partial_success() {
        let body = json!({
            "itemsReceived": 4,
            "itemsAccepted": 1,
            "errors": [
                {"index": 3, "statusCode": 500, "message": "internal"},
                {"index": 0, "statusCode": 429, "message": "throttled"},
                {"index": 1, "statusCode": 400, "message": "invalid"},
            ],
        });

        let outcome = classify(Ok(TransportResponse {
            status: 206,
            retry_after: None,
            body: serde_json::to_vec(&body).unwrap().into(),
        }));

        assert_eq!(
            outcome,
            SendOutcome::PartialSuccess {
                retry: vec![0, 3],
                rejected: 1
            }
        );
    }

    #[test]
    fn test_partial_success_without_errors() {
        let outcome = classify(Ok(TransportResponse {
            status: 206,
            retry_after: None,
            body: Bytes::from_static(b"{\"errors\": []}"),
        }));
        assert_eq!(outcome, SendOutcome::Success);
    }

    #[test]
    fn test_split_halves() {
        let mut unit = unit(5, HttpEncoding::Gzip);
        unit.attempt = 2;

        let (left, right) = unit.split().unwrap().unwrap();
        assert_eq!(names(&left), ["e0", "e1"]);
        assert_eq!(names(&right), ["e2", "e3", "e4"]);
        assert_eq!(left.item_count(), 2);
        assert_eq!(right.attempt, 2);
        assert!(right.record.is_none());

        let (single, _) = left.split().unwrap().unwrap();
        assert!(single.split().unwrap().is_none());
    }

    #[test]
    fn test_select_lines() {
        let unit = unit(4, HttpEncoding::Identity);
        let selected = unit.select(&[1, 3, 7]).unwrap().unwrap();
        assert_eq!(names(&selected), ["e1", "e3"]);
        assert!(unit.select(&[9]).unwrap().is_none());
    }

    #[test]
    fn test_request_headers() {
        let url = Url::parse("http://localhost/v2/track").unwrap();
        let request = unit(1, HttpEncoding::Gzip).request(&url);
        assert_eq!(request.content_type, CONTENT_TYPE);
        assert_eq!(request.content_encoding, Some("gzip"));
        assert_eq!(request.url, url);
    }
}
