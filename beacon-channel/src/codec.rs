//! Wire format of transmitted batches.
//!
//! Batches are sent as newline delimited JSON: one envelope per item and line. Since every line is
//! self-contained, payloads can be split and filtered without knowing the items they were created
//! from, which also works for payloads loaded from the overflow store.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use beacon_config::HttpEncoding;
use chrono::SecondsFormat;
use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::GzDecoder;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::item::TelemetryItem;

/// Content type of newline delimited JSON payloads.
pub const CONTENT_TYPE: &str = "application/x-json-stream";

/// Context tag carrying the correlation id.
const TAG_OPERATION_ID: &str = "ai.operation.id";
/// Context tag carrying the machine name.
const TAG_ROLE_INSTANCE: &str = "ai.cloud.roleInstance";

/// An error raised while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An item could not be serialized.
    #[error("failed to serialize item")]
    Json(#[from] serde_json::Error),
    /// Compressing or decompressing failed.
    #[error("failed to encode payload")]
    Io(#[from] io::Error),
}

/// Turns a batch of items into a payload.
///
/// Implementations must be deterministic: the same batch always yields the same bytes. Payloads
/// are sent as [`CONTENT_TYPE`], so every item must be encoded on a line of its own. Splitting and
/// partial retries rely on this.
pub trait Serializer: Send + Sync {
    /// Serializes the batch.
    fn serialize(&self, items: &[TelemetryItem]) -> Result<Vec<u8>, CodecError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    name: &'static str,
    time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    i_key: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<&'a str, &'a str>,
    data: Data,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Data {
    base_type: &'static str,
    base_data: Map<String, Value>,
}

/// Serializes items as one JSON envelope per line.
#[derive(Clone, Debug, Default)]
pub struct JsonLinesSerializer {
    instrumentation_key: Option<String>,
    tags: BTreeMap<String, String>,
}

impl JsonLinesSerializer {
    /// Creates a serializer writing the given instrumentation key into every envelope.
    pub fn new(instrumentation_key: Option<String>) -> Self {
        Self {
            instrumentation_key,
            tags: BTreeMap::new(),
        }
    }

    /// Tags every envelope with the name of this machine.
    pub fn with_role_instance(mut self, machine_name: Option<String>) -> Self {
        if let Some(name) = machine_name {
            self.tags.insert(TAG_ROLE_INSTANCE.to_owned(), name);
        }
        self
    }

    fn envelope<'a>(&'a self, item: &'a TelemetryItem) -> Envelope<'a> {
        let mut tags: BTreeMap<&str, &str> = self
            .tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        if let Some(ref id) = item.correlation_id {
            tags.insert(TAG_OPERATION_ID, id);
        }

        let mut base_data = match &item.data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_owned(), other.clone());
                map
            }
        };

        base_data.insert("ver".to_owned(), Value::from(2));
        if !item.properties.is_empty() {
            let properties = item
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            base_data.insert("properties".to_owned(), Value::Object(properties));
        }

        Envelope {
            name: item.kind.envelope_name(),
            time: item
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            sample_rate: item.sample_rate,
            i_key: self.instrumentation_key.as_deref(),
            tags,
            data: Data {
                base_type: item.kind.base_type(),
                base_data,
            },
        }
    }
}

impl Serializer for JsonLinesSerializer {
    fn serialize(&self, items: &[TelemetryItem]) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(items.len() * 256);
        for item in items {
            serde_json::to_writer(&mut payload, &self.envelope(item))?;
            payload.push(b'\n');
        }
        Ok(payload)
    }
}

/// Compresses a payload with the given encoding.
///
/// Gzip output is deterministic, the header carries no timestamp or file name.
pub fn encode(payload: &[u8], encoding: HttpEncoding) -> Result<Vec<u8>, CodecError> {
    match encoding {
        HttpEncoding::Identity => Ok(payload.to_vec()),
        HttpEncoding::Gzip => {
            let mut encoder = GzBuilder::new()
                .mtime(0)
                .write(Vec::with_capacity(payload.len() / 4), Compression::default());
            encoder.write_all(payload)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Reverses [`encode`].
pub fn decode(payload: &[u8], encoding: HttpEncoding) -> Result<Vec<u8>, CodecError> {
    match encoding {
        HttpEncoding::Identity => Ok(payload.to_vec()),
        HttpEncoding::Gzip => {
            let mut decoded = Vec::with_capacity(payload.len() * 4);
            GzDecoder::new(payload).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
    }
}

/// Returns the non-empty lines of a decoded payload, without line terminators.
pub fn split_lines(payload: &[u8]) -> Vec<&[u8]> {
    payload
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .collect()
}

/// Joins lines into a payload, terminating every line.
pub fn join_lines(lines: &[&[u8]]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        payload.extend_from_slice(line);
        payload.push(b'\n');
    }
    payload
}
