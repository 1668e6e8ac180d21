//! Named events describing the health of the channel.
//!
//! Failures inside the channel never reach the code that tracks items. Instead, every notable
//! transition is emitted as a [`DiagnosticEvent`]. Events are logged and counted by
//! [`Diagnostics`], and then passed to registered [`DiagnosticsSink`]s.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use beacon_common::Platform;
use beacon_statsd::metric;

use crate::statsd::{ChannelCounters, ChannelGauges};
use crate::transmission::FailureReason;

/// An event observable by diagnostics collaborators.
#[derive(Clone, Debug, PartialEq)]
pub enum DiagnosticEvent {
    /// A flush was requested explicitly.
    FlushRequested,
    /// The buffer reached its capacity and completed a batch early.
    BufferForcedFlush {
        /// Number of items in the completed batch.
        items: usize,
    },
    /// An item was dropped because no more batches can be held.
    BufferOverflowDrop {
        /// Number of items dropped by the buffer so far.
        total: u64,
    },
    /// The adaptive controller changed the sampling percentage.
    SamplingRateChanged {
        /// Percentage before the change.
        previous: f64,
        /// Percentage after the change.
        current: f64,
    },
    /// A transmission was accepted by the endpoint.
    SendSuccess {
        /// Number of items delivered.
        items: usize,
        /// Number of failed attempts before.
        attempt: u32,
    },
    /// A transmission failed and is scheduled for another attempt.
    SendRetry {
        /// Number of items in the transmission.
        items: usize,
        /// Number of failed attempts so far.
        attempt: u32,
        /// Classification of the failure.
        reason: FailureReason,
        /// Time until the next attempt.
        delay: Duration,
    },
    /// Items were dropped and will not be delivered.
    SendPermanentFailure {
        /// Number of dropped items.
        items: usize,
        /// Number of failed attempts.
        attempt: u32,
        /// Why the items were dropped.
        reason: FailureReason,
    },
    /// The endpoint asked to pause transmissions.
    Throttled {
        /// Length of the pause.
        delay: Duration,
    },
    /// Old records were removed from the overflow store to make room.
    OverflowQuotaEvicted {
        /// Number of evicted records.
        records: usize,
        /// Total size of evicted records in bytes.
        bytes: u64,
    },
    /// A record could not be read and was deleted.
    OverflowRecordCorrupt {
        /// File name of the record.
        name: String,
    },
    /// Records from a previous run were found in the overflow store.
    OverflowRecovered {
        /// Number of recovered records.
        records: usize,
    },
}

impl DiagnosticEvent {
    /// Returns the name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FlushRequested => "flush-requested",
            Self::BufferForcedFlush { .. } => "buffer-forced-flush",
            Self::BufferOverflowDrop { .. } => "buffer-overflow-drop",
            Self::SamplingRateChanged { .. } => "sampling-rate-changed",
            Self::SendSuccess { .. } => "send-success",
            Self::SendRetry { .. } => "send-retry",
            Self::SendPermanentFailure { .. } => "send-permanent-failure",
            Self::Throttled { .. } => "throttled",
            Self::OverflowQuotaEvicted { .. } => "overflow-store-quota-evicted",
            Self::OverflowRecordCorrupt { .. } => "overflow-store-record-corrupt",
            Self::OverflowRecovered { .. } => "overflow-store-recovered",
        }
    }
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Self::FlushRequested => Ok(()),
            Self::BufferForcedFlush { items } => write!(f, " items={items}"),
            Self::BufferOverflowDrop { total } => write!(f, " total={total}"),
            Self::SamplingRateChanged { previous, current } => {
                write!(f, " previous={previous} current={current}")
            }
            Self::SendSuccess { items, attempt } => write!(f, " items={items} attempt={attempt}"),
            Self::SendRetry {
                items,
                attempt,
                reason,
                delay,
            } => write!(
                f,
                " items={items} attempt={attempt} reason=\"{reason}\" delay={}s",
                delay.as_secs_f64()
            ),
            Self::SendPermanentFailure {
                items,
                attempt,
                reason,
            } => write!(f, " items={items} attempt={attempt} reason=\"{reason}\""),
            Self::Throttled { delay } => write!(f, " delay={}s", delay.as_secs_f64()),
            Self::OverflowQuotaEvicted { records, bytes } => {
                write!(f, " records={records} bytes={bytes}")
            }
            Self::OverflowRecordCorrupt { name } => write!(f, " name={name}"),
            Self::OverflowRecovered { records } => write!(f, " records={records}"),
        }
    }
}

/// Receives diagnostic events.
///
/// Sinks are called synchronously on the thread emitting the event, including producer threads,
/// so they must return quickly.
pub trait DiagnosticsSink: Send + Sync {
    /// Handles a single event.
    fn emit(&self, event: &DiagnosticEvent);
}

/// Writes events to the debug output of the platform.
pub struct DebugOutputSink {
    platform: Arc<dyn Platform>,
}

impl DebugOutputSink {
    /// Creates a sink writing to the given platform.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }
}

impl fmt::Debug for DebugOutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugOutputSink").finish_non_exhaustive()
    }
}

impl DiagnosticsSink for DebugOutputSink {
    fn emit(&self, event: &DiagnosticEvent) {
        self.platform.write_debug_output(&format!("beacon: {event}"));
    }
}

/// Logs, counts and distributes diagnostic events.
#[derive(Clone, Default)]
pub struct Diagnostics {
    sinks: Vec<Arc<dyn DiagnosticsSink>>,
}

impl Diagnostics {
    /// Creates diagnostics forwarding to the given sinks.
    pub fn new(sinks: Vec<Arc<dyn DiagnosticsSink>>) -> Self {
        Self { sinks }
    }

    /// Adds another sink.
    pub fn add_sink(&mut self, sink: Arc<dyn DiagnosticsSink>) {
        self.sinks.push(sink);
    }

    /// Emits an event.
    pub fn emit(&self, event: DiagnosticEvent) {
        match &event {
            DiagnosticEvent::FlushRequested => beacon_log::trace!("flush requested"),
            DiagnosticEvent::BufferForcedFlush { items } => {
                beacon_log::debug!(items, "buffer full, completing batch");
            }
            DiagnosticEvent::BufferOverflowDrop { total } => {
                beacon_log::warn!(total, "dropping item, too many pending batches");
                metric!(counter(ChannelCounters::ItemsDropped) += 1, reason = "buffer_full");
            }
            DiagnosticEvent::SamplingRateChanged { previous, current } => {
                beacon_log::info!(previous, current, "sampling percentage changed");
                metric!(gauge(ChannelGauges::SamplingPercentage) = *current);
            }
            DiagnosticEvent::SendSuccess { items, attempt } => {
                beacon_log::trace!(items, attempt, "transmission succeeded");
            }
            DiagnosticEvent::SendRetry {
                items,
                attempt,
                reason,
                delay,
            } => {
                beacon_log::debug!(
                    items,
                    attempt,
                    %reason,
                    delay = ?delay,
                    "transmission failed, retrying later"
                );
            }
            DiagnosticEvent::SendPermanentFailure {
                items,
                attempt,
                reason,
            } => {
                beacon_log::error!(items, attempt, %reason, "dropping telemetry");
            }
            DiagnosticEvent::Throttled { delay } => {
                beacon_log::warn!(delay = ?delay, "endpoint is throttling, pausing transmissions");
                metric!(counter(ChannelCounters::ThrottleEvents) += 1);
            }
            DiagnosticEvent::OverflowQuotaEvicted { records, bytes } => {
                beacon_log::warn!(records, bytes, "overflow store full, evicted oldest records");
            }
            DiagnosticEvent::OverflowRecordCorrupt { name } => {
                beacon_log::warn!(record = %name, "discarded corrupt overflow record");
            }
            DiagnosticEvent::OverflowRecovered { records } => {
                beacon_log::info!(records, "recovered records from overflow store");
            }
        }

        for sink in &self.sinks {
            sink.emit(&event);
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io;
    use std::path::Path;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct CapturePlatform(Mutex<Vec<String>>);

    impl Platform for CapturePlatform {
        fn application_settings(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        fn read_configuration(&self, _path: &Path) -> io::Result<Option<String>> {
            Ok(None)
        }

        fn write_debug_output(&self, message: &str) {
            self.0.lock().push(message.to_owned());
        }

        fn machine_name(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_event_display() {
        let event = DiagnosticEvent::SendRetry {
            items: 3,
            attempt: 2,
            reason: FailureReason::Status(500),
            delay: Duration::from_secs(20),
        };
        assert_eq!(
            event.to_string(),
            "send-retry items=3 attempt=2 reason=\"status 500\" delay=20s"
        );
        assert_eq!(DiagnosticEvent::FlushRequested.to_string(), "flush-requested");
    }

    #[test]
    fn test_debug_output_sink() {
        let platform = Arc::new(CapturePlatform::default());
        let diagnostics = Diagnostics::new(vec![Arc::new(DebugOutputSink::new(platform.clone()))]);

        diagnostics.emit(DiagnosticEvent::OverflowQuotaEvicted {
            records: 2,
            bytes: 512,
        });

        assert_eq!(
            *platform.0.lock(),
            ["beacon: overflow-store-quota-evicted records=2 bytes=512"]
        );
    }
}
