//! Durable storage for transmissions that could not be delivered right away.
//!
//! Every record lives in its own file within the storage directory. Files are named after a
//! monotonically increasing sequence number, so the lexical order of the directory listing
//! matches the order in which records were created. Records are written to a temporary file,
//! synced and renamed into place, so a crash never leaves a partially written record behind under
//! its final name.
//!
//! The store keeps an index of all records in memory. A record is claimed before it is sent,
//! which hides it from other readers and protects it from eviction until it is released or
//! deleted.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_statsd::metric;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::statsd::{ChannelCounters, ChannelGauges};

mod record;

pub use self::record::*;

/// File extension of complete records.
const RECORD_EXTENSION: &str = "trn";
/// File extension of records that are being written.
const TEMP_EXTENSION: &str = "tmp";
/// Name of the file holding the total size of all records.
const USAGE_MARKER: &str = "usage";

/// An error returned by the [`OverflowStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A file system operation failed.
    #[error("failed to perform I/O operation")]
    Io(#[from] io::Error),
    /// A file system operation did not complete within the I/O timeout.
    #[error("I/O operation timed out")]
    Timeout,
    /// A record could not be parsed.
    #[error("corrupt record: {0}")]
    Corruption(String),
    /// The record is larger than the entire quota.
    #[error("record of {size} bytes exceeds the storage quota of {max} bytes")]
    TooLarge {
        /// Size of the record in bytes.
        size: u64,
        /// The storage quota in bytes.
        max: u64,
    },
    /// The quota is used up by records that are currently claimed.
    #[error("storage quota exhausted")]
    Full,
}

/// Identifier of a record in the store.
///
/// Ids are ordered by creation, so the smallest id denotes the oldest record.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RecordId(u64);

impl RecordId {
    fn file_name(self) -> String {
        format!("{self}.{RECORD_EXTENSION}")
    }

    fn temp_name(self) -> String {
        format!("{self}.{TEMP_EXTENSION}")
    }

    fn parse(stem: &str) -> Option<Self> {
        stem.parse().ok().map(Self)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

/// Result of the initial scan of the storage directory.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Number of valid records found.
    pub recovered: usize,
    /// File names of records that were deleted because they could not be read.
    pub corrupt: Vec<String>,
    /// Total size of recovered records in bytes.
    pub bytes: u64,
}

/// Result of persisting a record.
#[derive(Debug)]
pub struct PersistOutcome {
    /// Id of the new record.
    pub id: RecordId,
    /// Number of older records that were evicted to make room.
    pub evicted_records: usize,
    /// Total size of evicted records in bytes.
    pub evicted_bytes: u64,
}

/// A record that was claimed for sending.
#[derive(Debug)]
pub struct ClaimedRecord {
    /// Id of the record.
    pub id: RecordId,
    /// The metadata of the record.
    pub header: RecordHeader,
    /// The encoded payload.
    pub payload: Bytes,
}

#[derive(Debug)]
struct RecordMeta {
    size: u64,
    claimed: bool,
    not_before: Option<Instant>,
}

impl RecordMeta {
    fn is_ready(&self, now: Instant) -> bool {
        !self.claimed && self.not_before.is_none_or(|not_before| not_before <= now)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    index: BTreeMap<RecordId, RecordMeta>,
    total: u64,
    next_sequence: u64,
}

impl StoreState {
    fn remove(&mut self, id: RecordId) -> Option<RecordMeta> {
        let meta = self.index.remove(&id)?;
        self.total = self.total.saturating_sub(meta.size);
        Some(meta)
    }
}

/// A bounded, file-backed store of transmission payloads.
#[derive(Debug)]
pub struct OverflowStore {
    path: PathBuf,
    max_size: u64,
    io_timeout: Duration,
    state: Mutex<StoreState>,
}

impl OverflowStore {
    /// Opens the store, creating the directory if needed, and scans existing records.
    ///
    /// Leftover temporary files and records that cannot be parsed are deleted. Opening only fails
    /// if the directory cannot be created or listed.
    pub async fn open(
        path: impl Into<PathBuf>,
        max_size: u64,
        io_timeout: Duration,
    ) -> Result<(Self, ScanReport), StoreError> {
        let store = Self {
            path: path.into(),
            max_size,
            io_timeout,
            state: Mutex::new(StoreState::default()),
        };

        let report = store.scan().await?;
        Ok((store, report))
    }

    /// Returns the storage directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn io<T>(&self, future: impl Future<Output = io::Result<T>>) -> Result<T, StoreError> {
        match tokio::time::timeout(self.io_timeout, future).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn remove_file(&self, name: &str) -> Result<(), StoreError> {
        match self.io(tokio::fs::remove_file(self.path.join(name))).await {
            Err(StoreError::Io(error)) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }

    /// Reads and validates the header of a record file, returning it with the file size.
    async fn read_header(&self, path: &Path) -> Result<(RecordHeader, u64), StoreError> {
        let mut file = self.io(tokio::fs::File::open(path)).await?;
        let size = self.io(file.metadata()).await?.len();

        let mut buf = [0; HEADER_SIZE];
        match self.io(file.read_exact(&mut buf)).await {
            Err(StoreError::Io(error)) if error.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(StoreError::Corruption("truncated header".to_owned()));
            }
            result => result?,
        };

        Ok((decode_header(&buf, size)?, size))
    }

    async fn scan(&self) -> Result<ScanReport, StoreError> {
        self.io(tokio::fs::create_dir_all(&self.path)).await?;

        let mut report = ScanReport::default();
        let mut state = self.state.lock().await;
        let mut entries = self.io(tokio::fs::read_dir(&self.path)).await?;

        while let Some(entry) = self.io(entries.next_entry()).await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };

            match path.extension().and_then(|e| e.to_str()) {
                Some(TEMP_EXTENSION) => {
                    beacon_log::debug!(file = %name, "deleting incomplete record");
                    self.remove_file(&name).await?;
                }
                Some(RECORD_EXTENSION) => {
                    let id = path.file_stem().and_then(|s| s.to_str()).and_then(RecordId::parse);
                    let result = match id {
                        Some(id) => self.read_header(&path).await.map(|(_, size)| (id, size)),
                        None => Err(StoreError::Corruption("invalid file name".to_owned())),
                    };

                    match result {
                        Ok((id, size)) => {
                            state.index.insert(
                                id,
                                RecordMeta {
                                    size,
                                    claimed: false,
                                    not_before: None,
                                },
                            );
                            state.total += size;
                            state.next_sequence = state.next_sequence.max(id.0 + 1);
                        }
                        Err(error @ StoreError::Corruption(_)) => {
                            beacon_log::warn!(
                                file = %name,
                                error = &error as &dyn std::error::Error,
                                "deleting corrupt overflow record"
                            );
                            self.remove_file(&name).await?;
                            report.corrupt.push(name);
                        }
                        Err(error) => return Err(error),
                    }
                }
                _ => {}
            }
        }

        report.recovered = state.index.len();
        report.bytes = state.total;

        metric!(counter(ChannelCounters::StoreCorruptRecords) += report.corrupt.len() as i64);
        self.write_usage(&state).await;

        beacon_log::info!(
            records = report.recovered,
            bytes = report.bytes,
            path = %self.path.display(),
            "opened overflow store"
        );

        Ok(report)
    }

    /// Persists the usage marker and reports the store size.
    ///
    /// The marker is informational, so failing to write it is only logged.
    async fn write_usage(&self, state: &StoreState) {
        metric!(gauge(ChannelGauges::StoreRecords) = state.index.len() as u64);
        metric!(gauge(ChannelGauges::StoreBytes) = state.total);

        let content = state.total.to_string();
        if let Err(error) = self
            .io(tokio::fs::write(self.path.join(USAGE_MARKER), content))
            .await
        {
            beacon_log::debug!(
                error = &error as &dyn std::error::Error,
                "failed to write usage marker"
            );
        }
    }

    async fn write_record(
        &self,
        id: RecordId,
        header: &RecordHeader,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let temp_path = self.path.join(id.temp_name());
        let data = encode_record(header, payload);

        let result = async {
            let mut file = self.io(tokio::fs::File::create(&temp_path)).await?;
            self.io(file.write_all(&data)).await?;
            self.io(file.sync_all()).await?;
            self.io(tokio::fs::rename(&temp_path, self.path.join(id.file_name())))
                .await
        }
        .await;

        if result.is_err() {
            // Leftovers are also cleaned up by the next scan.
            self.remove_file(&id.temp_name()).await.ok();
        }

        result
    }

    /// Writes a new record, evicting the oldest unclaimed records if the quota requires.
    ///
    /// The record is not handed out by [`claim_next`](Self::claim_next) before `not_before`.
    pub async fn persist(
        &self,
        header: &RecordHeader,
        payload: &[u8],
        not_before: Option<Instant>,
    ) -> Result<PersistOutcome, StoreError> {
        let size = (HEADER_SIZE + payload.len()) as u64;
        if size > self.max_size {
            return Err(StoreError::TooLarge {
                size,
                max: self.max_size,
            });
        }

        let mut state = self.state.lock().await;

        let mut evicted_records = 0;
        let mut evicted_bytes = 0;
        while state.total + size > self.max_size {
            let oldest = state
                .index
                .iter()
                .find(|(_, meta)| !meta.claimed)
                .map(|(id, _)| *id);

            let Some(id) = oldest else {
                return Err(StoreError::Full);
            };

            self.remove_file(&id.file_name()).await?;
            if let Some(meta) = state.remove(id) {
                evicted_records += 1;
                evicted_bytes += meta.size;
            }
        }

        metric!(counter(ChannelCounters::StoreEvictions) += evicted_records as i64);

        let id = RecordId(state.next_sequence);
        state.next_sequence += 1;

        let result = self.write_record(id, header, payload).await;
        if result.is_ok() {
            state.index.insert(
                id,
                RecordMeta {
                    size,
                    claimed: false,
                    not_before,
                },
            );
            state.total += size;
        }

        self.write_usage(&state).await;
        result?;

        Ok(PersistOutcome {
            id,
            evicted_records,
            evicted_bytes,
        })
    }

    /// Claims the oldest record that is ready to be sent.
    ///
    /// Records that turn out to be unreadable are deleted and skipped. A claimed record stays on
    /// disk until it is [deleted](Self::delete) or [released](Self::release).
    pub async fn claim_next(&self, now: Instant) -> Result<Option<ClaimedRecord>, StoreError> {
        let mut state = self.state.lock().await;

        loop {
            let next = state
                .index
                .iter_mut()
                .find(|(_, meta)| meta.is_ready(now));

            let Some((&id, meta)) = next else {
                return Ok(None);
            };
            meta.claimed = true;

            match self.read_record(id).await {
                Ok(record) => return Ok(Some(record)),
                Err(error @ StoreError::Corruption(_)) => {
                    beacon_log::warn!(
                        record = %id,
                        error = &error as &dyn std::error::Error,
                        "deleting corrupt overflow record"
                    );
                    metric!(counter(ChannelCounters::StoreCorruptRecords) += 1);
                    self.remove_file(&id.file_name()).await?;
                    state.remove(id);
                    self.write_usage(&state).await;
                }
                Err(error) => {
                    if let Some(meta) = state.index.get_mut(&id) {
                        meta.claimed = false;
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn read_record(&self, id: RecordId) -> Result<ClaimedRecord, StoreError> {
        let data = match self.io(tokio::fs::read(self.path.join(id.file_name()))).await {
            Err(StoreError::Io(error)) if error.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::Corruption("record file missing".to_owned()));
            }
            result => Bytes::from(result?),
        };

        let header = decode_header(&data, data.len() as u64)?;
        Ok(ClaimedRecord {
            id,
            header,
            payload: data.slice(HEADER_SIZE..),
        })
    }

    /// Rewrites a claimed record with updated metadata and makes it available again.
    pub async fn release(
        &self,
        id: RecordId,
        header: &RecordHeader,
        payload: &[u8],
        not_before: Option<Instant>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        let result = self.write_record(id, header, payload).await;
        let size = (HEADER_SIZE + payload.len()) as u64;

        if let Some(meta) = state.index.get_mut(&id) {
            let previous = meta.size;
            meta.claimed = false;
            meta.not_before = not_before;
            if result.is_ok() {
                meta.size = size;
                state.total = state.total.saturating_sub(previous) + size;
            }
        }

        self.write_usage(&state).await;
        result
    }

    /// Deletes a record.
    pub async fn delete(&self, id: RecordId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.remove_file(&id.file_name()).await?;
        state.remove(id);
        self.write_usage(&state).await;
        Ok(())
    }

    /// Returns the number of records, including claimed ones.
    pub async fn len(&self) -> usize {
        self.state.lock().await.index.len()
    }

    /// Returns `true` if the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.index.is_empty()
    }

    /// Returns the total size of all records in bytes.
    pub async fn usage(&self) -> u64 {
        self.state.lock().await.total
    }

    /// Returns the earliest time after `now` at which a waiting record becomes ready.
    pub async fn next_retry_after(&self, now: Instant) -> Option<Instant> {
        let state = self.state.lock().await;
        state
            .index
            .values()
            .filter(|meta| !meta.claimed)
            .filter_map(|meta| meta.not_before)
            .filter(|&not_before| not_before > now)
            .min()
    }
}
