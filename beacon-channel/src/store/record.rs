//! Binary layout of overflow records.
//!
//! Every record file starts with a fixed-size header followed by the encoded payload:
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | magic `BCN1`                            |
//! | 4      | 1    | format version                          |
//! | 5      | 1    | payload encoding (0 identity, 1 gzip)   |
//! | 6      | 4    | item count (u32, little endian)         |
//! | 10     | 4    | attempt count (u32, little endian)      |
//! | 14     | 8    | creation time in ms (u64, little endian)|
//! | 22     | 8    | payload length (u64, little endian)     |

use beacon_common::UnixTimestamp;
use beacon_config::HttpEncoding;

use crate::store::StoreError;

const MAGIC: &[u8; 4] = b"BCN1";
const VERSION: u8 = 1;

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 30;

/// Metadata stored in front of every persisted payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordHeader {
    /// Encoding of the payload.
    pub encoding: HttpEncoding,
    /// Number of items in the payload.
    pub item_count: u32,
    /// Number of failed attempts.
    pub attempt: u32,
    /// Creation time of the batch.
    pub created: UnixTimestamp,
}

fn encoding_tag(encoding: HttpEncoding) -> u8 {
    match encoding {
        HttpEncoding::Identity => 0,
        HttpEncoding::Gzip => 1,
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Serializes a complete record.
pub fn encode_record(header: &RecordHeader, payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(MAGIC);
    buffer.push(VERSION);
    buffer.push(encoding_tag(header.encoding));
    buffer.extend_from_slice(&header.item_count.to_le_bytes());
    buffer.extend_from_slice(&header.attempt.to_le_bytes());
    buffer.extend_from_slice(&header.created.as_millis().to_le_bytes());
    buffer.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buffer.extend_from_slice(payload);
    buffer
}

/// Parses the header of a record and validates it against the total file size.
pub fn decode_header(bytes: &[u8], file_size: u64) -> Result<RecordHeader, StoreError> {
    if bytes.len() < HEADER_SIZE {
        return Err(StoreError::Corruption("truncated header".to_owned()));
    }

    if &bytes[0..4] != MAGIC {
        return Err(StoreError::Corruption("invalid magic".to_owned()));
    }

    if bytes[4] != VERSION {
        return Err(StoreError::Corruption(format!(
            "unsupported version {}",
            bytes[4]
        )));
    }

    let encoding = match bytes[5] {
        0 => HttpEncoding::Identity,
        1 => HttpEncoding::Gzip,
        other => {
            return Err(StoreError::Corruption(format!("unknown encoding {other}")));
        }
    };

    let payload_len = read_u64(&bytes[22..30]);
    if file_size != HEADER_SIZE as u64 + payload_len {
        return Err(StoreError::Corruption(format!(
            "expected {payload_len} payload bytes, found {}",
            file_size.saturating_sub(HEADER_SIZE as u64)
        )));
    }

    Ok(RecordHeader {
        encoding,
        item_count: read_u32(&bytes[6..10]),
        attempt: read_u32(&bytes[10..14]),
        created: UnixTimestamp::from_millis(read_u64(&bytes[14..22])),
    })
}
