//! The telemetry channel: buffering, sampling and reliable delivery of telemetry items.
//!
//! Applications hand items to a [`Channel`] with [`Channel::track`]. Tracking never blocks and
//! never fails. Items are collected in an [`ItemBuffer`] until a batch is complete, the flush
//! interval elapses or a flush is requested. A background scheduler then samples the batch,
//! serializes it into a [`TransmissionUnit`] and sends it to the ingestion endpoint.
//!
//! # Path of an item through the channel
//!
//! ```text
//! track ──> ItemBuffer ──> SamplingEngine ──> TransmissionUnit ──> Transport ──> endpoint
//!                                                   │    ^
//!                                          failure  v    │  retry
//!                                               OverflowStore
//! ```
//!
//! Transmissions that fail with a transient error are written to the [`OverflowStore`] on disk
//! and retried with exponential backoff. When the endpoint throttles, all transmissions pause
//! until the requested time has passed. Records left in the store when the process exits are
//! sent on the next start, before any new items.
//!
//! Nothing that goes wrong inside the channel is reported back to the application. Instead, the
//! channel emits [`DiagnosticEvent`]s, logs and records internal metrics.
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use beacon_common::{DefaultPlatform, Platform};
use beacon_config::Config;
use beacon_sampling::SamplingEngine;
use beacon_statsd::metric;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

mod buffer;
mod codec;
mod diagnostics;
mod http;
mod item;
mod scheduler;
mod statsd;
mod store;
mod throttle;
mod transmission;
mod utils;

#[cfg(test)]
mod testutils;

pub use self::buffer::*;
pub use self::codec::*;
pub use self::diagnostics::*;
pub use self::http::*;
pub use self::item::*;
pub use self::scheduler::ShutdownReport;
pub use self::store::{
    ClaimedRecord, OverflowStore, PersistOutcome, RecordHeader, RecordId, ScanReport, StoreError,
};
pub use self::throttle::*;
pub use self::transmission::*;

use self::scheduler::{Control, Scheduler};
use self::statsd::ChannelCounters;

/// Capacity of the queue of control messages to the scheduler.
const CONTROL_CAPACITY: usize = 16;

/// Collaborators of a [`Channel`] that are not part of the configuration.
pub struct ChannelOptions {
    /// Access to platform services, used for the machine name and debug output.
    pub platform: Arc<dyn Platform>,
    /// Additional receivers of diagnostic events.
    pub sinks: Vec<Arc<dyn DiagnosticsSink>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            platform: Arc::new(DefaultPlatform),
            sinks: Vec::new(),
        }
    }
}

/// An error starting a [`Channel`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The overflow store could not be opened.
    #[error("failed to open the overflow store")]
    Store(#[from] StoreError),
}

/// Handle to a running telemetry channel.
///
/// The channel is shared by all producers. Dropping it stops the scheduler after a final flush,
/// but only [`shutdown`](Self::shutdown) waits for that flush to complete.
#[derive(Debug)]
pub struct Channel {
    buffer: Arc<ItemBuffer>,
    sampling: Arc<SamplingEngine>,
    diagnostics: Diagnostics,
    control: mpsc::Sender<Control>,
    handle: JoinHandle<()>,
}

impl Channel {
    /// Opens the overflow store and starts the scheduler on the current runtime.
    ///
    /// Records found in the overflow store are scheduled before anything tracked on the returned
    /// channel. Corrupt records are deleted and reported through diagnostics.
    pub async fn start<T: Transport>(
        config: Arc<Config>,
        transport: T,
        options: ChannelOptions,
    ) -> Result<Self, ChannelError> {
        let mut diagnostics = Diagnostics::new(options.sinks);
        if config.debug_output() {
            diagnostics.add_sink(Arc::new(DebugOutputSink::new(options.platform.clone())));
        }

        let (store, report) = OverflowStore::open(
            config.storage_path(),
            config.storage_max_size(),
            config.storage_io_timeout(),
        )
        .await?;

        for name in report.corrupt {
            diagnostics.emit(DiagnosticEvent::OverflowRecordCorrupt { name });
        }
        if report.recovered > 0 {
            diagnostics.emit(DiagnosticEvent::OverflowRecovered {
                records: report.recovered,
            });
        }

        let serializer = JsonLinesSerializer::new(config.instrumentation_key().map(str::to_owned))
            .with_role_instance(options.platform.machine_name());

        let buffer = Arc::new(ItemBuffer::new(
            config.buffer_max_items(),
            config.buffer_max_size(),
            config.max_pending_batches(),
        ));
        let sampling = Arc::new(SamplingEngine::new(
            config.sampling().clone(),
            tokio::time::Instant::now().into_std(),
        ));

        let (control, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let scheduler = Scheduler::new(
            config,
            buffer.clone(),
            sampling.clone(),
            Arc::new(serializer),
            transport,
            Arc::new(store),
            diagnostics.clone(),
            control_rx,
        );
        let handle = tokio::spawn(scheduler.run());

        Ok(Self {
            buffer,
            sampling,
            diagnostics,
            control,
            handle,
        })
    }

    /// Submits an item for transmission.
    ///
    /// This never blocks beyond a short critical section and never fails. If the channel cannot
    /// keep up, the item is dropped and a diagnostic event is emitted.
    pub fn track(&self, mut item: TelemetryItem) {
        item.normalize();
        metric!(counter(ChannelCounters::ItemsTracked) += 1);

        match self.buffer.push(item) {
            PushOutcome::Added => {}
            PushOutcome::BatchReady { items } => {
                self.diagnostics
                    .emit(DiagnosticEvent::BufferForcedFlush { items });
            }
            PushOutcome::Dropped { total } => {
                self.diagnostics
                    .emit(DiagnosticEvent::BufferOverflowDrop { total });
            }
        }
    }

    /// Requests that all buffered items are sent now.
    ///
    /// Returns immediately, without waiting for the items to be delivered.
    pub fn flush(&self) {
        self.diagnostics.emit(DiagnosticEvent::FlushRequested);
        // A full queue already holds a pending flush or shutdown.
        self.control.try_send(Control::Flush).ok();
    }

    /// Marks an operation as complete.
    ///
    /// Items of an operation are sampled consistently for as long as it is active. Operations
    /// that are never ended expire after the configured time.
    pub fn end_operation(&self, correlation_id: &str) {
        self.sampling.end_operation(correlation_id);
    }

    /// Returns the sampling percentage currently applied to new operations.
    pub fn sampling_percentage(&self) -> f64 {
        self.sampling.percentage()
    }

    /// Flushes the buffer and waits up to `timeout` for transmissions to complete.
    ///
    /// Transmissions that do not complete in time are written to the overflow store.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownReport {
        let (reply, rx) = oneshot::channel();
        let deadline = tokio::time::Instant::now() + timeout;

        if self
            .control
            .send(Control::Shutdown { deadline, reply })
            .await
            .is_err()
        {
            beacon_log::warn!("transmission scheduler stopped before shutdown");
            return ShutdownReport::default();
        }

        let report = rx.await.unwrap_or_default();
        if let Err(error) = self.handle.await {
            beacon_log::error!(
                error = &error as &dyn std::error::Error,
                "transmission scheduler failed"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::testutils::{MockResponse, MockTransport, RecordingSink, event, test_config};

    fn options(sink: &Arc<RecordingSink>) -> ChannelOptions {
        ChannelOptions {
            platform: Arc::new(DefaultPlatform),
            sinks: vec![sink.clone()],
        }
    }

    fn record_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|entry| {
                let path = entry.as_ref().unwrap().path();
                path.extension().is_some_and(|ext| ext == "trn")
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_with_retry_after() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({}));
        let transport = MockTransport::new([MockResponse::status(429).retry_after("30")]);
        let sink = Arc::new(RecordingSink::default());

        let start = Instant::now();
        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();

        channel.track(event("first"));
        channel.flush();
        transport.wait_for_requests(1).await;

        // Tracked while throttled: must neither be sent nor bypass the pause.
        tokio::time::sleep(Duration::from_secs(5)).await;
        channel.track(event("second"));
        channel.flush();

        let requests = transport.wait_for_requests(3).await;
        assert!(requests[0].at - start < Duration::from_secs(1));
        assert!(requests[1].at - requests[0].at >= Duration::from_secs(30));
        assert!(requests[2].at - requests[0].at >= Duration::from_secs(30));

        let mut names: Vec<_> = requests[1..].iter().flat_map(|r| r.names()).collect();
        names.sort();
        assert_eq!(names, ["first", "second"]);
        assert!(sink.names().contains(&"throttled"));

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.sent, 2);
        assert_eq!(report.persisted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_retry_after_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({"retry": {"max_interval": 120}}));
        let transport = MockTransport::new([
            MockResponse::status(429).retry_after("99999999999999999999"),
        ]);
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();

        channel.track(event("first"));
        channel.flush();
        transport.wait_for_requests(1).await;

        channel.track(event("second"));
        channel.flush();

        let requests = transport.wait_for_requests(3).await;
        let pause = requests[1].at - requests[0].at;
        assert!(pause >= Duration::from_secs(120), "resumed after {pause:?}");
        assert!(pause < Duration::from_secs(125), "resumed after {pause:?}");

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.sent, 2);
        assert_eq!(report.persisted, 0);
        assert_eq!(report.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_batches_move_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            json!({"buffer": {"max_items": 1, "max_pending_batches": 1}}),
        );
        let transport = MockTransport::new([MockResponse::status(429).retry_after("3600")]);
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();

        for i in 0..5 {
            channel.track(event(&format!("item-{i}")));
            while record_files(dir.path()) < i + 1 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        assert_eq!(transport.requests().len(), 1);
        assert!(!sink.names().contains(&"buffer-overflow-drop"));

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.persisted, 5);
        assert_eq!(report.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_releases_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({}));
        // The second failure happens on a unit claimed from the store.
        let transport = MockTransport::new([MockResponse::panic(), MockResponse::panic()]);
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();

        channel.track(event("first"));
        channel.flush();

        let requests = transport.wait_for_requests(3).await;
        assert!(requests[1].at - requests[0].at >= Duration::from_secs(10));
        assert!(requests[2].at - requests[1].at >= Duration::from_secs(20));
        assert_eq!(requests[2].names(), ["first"]);

        let retries = sink.names().iter().filter(|n| **n == "send-retry").count();
        assert_eq!(retries, 2);

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.persisted, 0);
        assert_eq!(report.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({}));
        let transport = MockTransport::new([
            MockResponse::status(500),
            MockResponse::status(500),
            MockResponse::status(500),
        ]);
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        channel.track(event("retried"));
        channel.flush();

        let requests = transport.wait_for_requests(4).await;
        let gaps: Vec<_> = requests
            .windows(2)
            .map(|pair| (pair[1].at - pair[0].at).as_secs())
            .collect();
        assert_eq!(gaps, [10, 20, 40]);
        assert!(requests.iter().all(|r| r.names() == ["retried"]));

        // Give the scheduler a chance to process the final response.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(record_files(dir.path()), 0);

        let retries = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, DiagnosticEvent::SendRetry { .. }))
            .count();
        assert_eq!(retries, 3);
        assert!(sink.names().contains(&"send-success"));

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(transport.requests().len(), 4);
        assert_eq!(report.sent, 1);
        assert_eq!(report.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({"retry": {"max_attempts": 2}}));
        let transport = MockTransport::new([MockResponse::status(503), MockResponse::status(503)]);
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        channel.track(event("lost"));
        channel.flush();

        transport.wait_for_requests(2).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(sink.names().contains(&"send-permanent-failure"));
        assert_eq!(record_files(dir.path()), 0);

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_records_sent_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({"http": {"max_concurrent_requests": 1}}));

        {
            let (store, _) = OverflowStore::open(dir.path(), 1 << 20, Duration::from_secs(5))
                .await
                .unwrap();
            let serializer = JsonLinesSerializer::default();
            for i in 0..5 {
                let items = [event(&format!("stored-{i}"))];
                let unit = TransmissionUnit::from_items(
                    &items,
                    &serializer,
                    beacon_config::HttpEncoding::Identity,
                )
                .unwrap();
                store
                    .persist(&unit.record_header(), unit.payload(), None)
                    .await
                    .unwrap();
            }
        }

        let transport = MockTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        assert!(sink.events().contains(&DiagnosticEvent::OverflowRecovered { records: 5 }));

        channel.track(event("new"));
        channel.flush();

        let requests = transport.wait_for_requests(6).await;
        let names: Vec<_> = requests.iter().flat_map(|r| r.names()).collect();
        assert_eq!(
            names,
            ["stored-0", "stored-1", "stored-2", "stored-3", "stored-4", "new"]
        );

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.sent, 6);
        assert_eq!(record_files(dir.path()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({}));
        let transport = MockTransport::default();
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        channel.flush();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(sink.names(), ["flush-requested"]);
        assert!(transport.requests().is_empty());
        assert_eq!(record_files(dir.path()), 0);

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_dispatches_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({"buffer": {"max_items": 3}}));
        let transport = MockTransport::default();
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        for name in ["a", "b", "c", "d"] {
            channel.track(event(name));
        }

        let requests = transport.wait_for_requests(1).await;
        assert_eq!(requests[0].names(), ["a", "b", "c"]);
        assert!(sink.events().contains(&DiagnosticEvent::BufferForcedFlush { items: 3 }));

        channel.shutdown(Duration::from_secs(5)).await;
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].names(), ["d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_too_large_splits() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({}));
        let transport = MockTransport::new([MockResponse::status(413)]);
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        for name in ["a", "b", "c", "d"] {
            channel.track(event(name));
        }
        channel.flush();

        let requests = transport.wait_for_requests(3).await;
        assert_eq!(requests[0].names(), ["a", "b", "c", "d"]);

        let mut halves = vec![requests[1].names(), requests[2].names()];
        halves.sort();
        assert_eq!(halves, [["a", "b"], ["c", "d"]]);

        channel.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success_retries_items() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({}));
        let transport = MockTransport::new([MockResponse::status(206).body(json!({
            "itemsReceived": 3,
            "itemsAccepted": 1,
            "errors": [
                {"index": 1, "statusCode": 500, "message": "try again"},
                {"index": 2, "statusCode": 400, "message": "invalid"},
            ],
        }))]);
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        for name in ["a", "b", "c"] {
            channel.track(event(name));
        }
        channel.flush();

        let requests = transport.wait_for_requests(2).await;
        assert_eq!(requests[1].names(), ["b"]);
        assert_eq!(requests[1].at - requests[0].at, Duration::from_secs(10));
        assert!(sink.events().contains(&DiagnosticEvent::SendPermanentFailure {
            items: 1,
            attempt: 0,
            reason: FailureReason::Rejected,
        }));

        channel.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_persists_unsent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), json!({}));
        let transport =
            MockTransport::new([MockResponse::status(200).delay(Duration::from_secs(60))]);
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config.clone(), transport.clone(), options(&sink))
            .await
            .unwrap();
        channel.track(event("slow"));
        channel.flush();
        transport.wait_for_requests(1).await;

        let report = channel.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.sent, 0);
        assert_eq!(report.persisted, 1);
        assert_eq!(record_files(dir.path()), 1);

        // The next run picks up the persisted record.
        let transport = MockTransport::default();
        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        let requests = transport.wait_for_requests(1).await;
        assert_eq!(requests[0].names(), ["slow"]);
        channel.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_annotates_items() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            json!({"sampling": {"mode": "fixed", "percentage": 50.0}}),
        );
        let transport = MockTransport::default();
        let sink = Arc::new(RecordingSink::default());

        let channel = Channel::start(config, transport.clone(), options(&sink))
            .await
            .unwrap();
        for i in 0..200 {
            channel.track(event(&format!("e{i}")).with_correlation_id("shared-operation"));
        }
        channel.flush();
        channel.shutdown(Duration::from_secs(5)).await;

        // All items share one operation, so they are either all kept or all dropped.
        let lines: Vec<_> = transport
            .requests()
            .into_iter()
            .flat_map(|r| r.lines)
            .collect();
        assert!(lines.is_empty() || lines.len() == 200);
        assert!(lines.iter().all(|line| line["sampleRate"] == json!(50.0)));
    }
}
