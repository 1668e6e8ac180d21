use beacon_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics used by the channel.
pub enum ChannelCounters {
    /// Number of items passed to `track`.
    ItemsTracked,
    /// Number of items that did not reach the endpoint.
    ///
    /// This metric is tagged with:
    /// - `reason`: `buffer_full`, `sampled`, `rejected`, `retries_exhausted`, `too_large` or
    ///   `store_full`.
    ItemsDropped,
    /// Number of batches taken from the item buffer.
    ///
    /// This metric is tagged with:
    /// - `trigger`: `full`, `interval`, `flush` or `shutdown`.
    BatchesCreated,
    /// Number of completed send attempts.
    ///
    /// This metric is tagged with:
    /// - `result`: the classified outcome of the attempt.
    TransmissionOutcome,
    /// Number of throttling responses from the endpoint.
    ThrottleEvents,
    /// Number of records evicted from the overflow store to make room for newer ones.
    StoreEvictions,
    /// Number of unreadable records deleted from the overflow store.
    StoreCorruptRecords,
}

impl CounterMetric for ChannelCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::ItemsTracked => "channel.items.tracked",
            Self::ItemsDropped => "channel.items.dropped",
            Self::BatchesCreated => "channel.batches.created",
            Self::TransmissionOutcome => "channel.transmission.outcome",
            Self::ThrottleEvents => "channel.throttle.events",
            Self::StoreEvictions => "channel.store.evictions",
            Self::StoreCorruptRecords => "channel.store.corrupt_records",
        }
    }
}

/// Gauge metrics used by the channel.
pub enum ChannelGauges {
    /// The sampling percentage currently applied.
    SamplingPercentage,
    /// Number of records in the overflow store.
    StoreRecords,
    /// Total size of all records in the overflow store in bytes.
    StoreBytes,
    /// Number of requests in flight.
    InflightTransmissions,
}

impl GaugeMetric for ChannelGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::SamplingPercentage => "channel.sampling.percentage",
            Self::StoreRecords => "channel.store.records",
            Self::StoreBytes => "channel.store.bytes",
            Self::InflightTransmissions => "channel.transmission.inflight",
        }
    }
}

/// Timer metrics used by the channel.
pub enum ChannelTimers {
    /// Time from starting a request until its outcome is known.
    ///
    /// This metric is tagged with:
    /// - `result`: the classified outcome of the attempt.
    SendDuration,
}

impl TimerMetric for ChannelTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::SendDuration => "channel.transmission.duration",
        }
    }
}

/// Distribution metrics used by the channel.
pub enum ChannelDistributions {
    /// Number of items in a transmission unit after sampling.
    BatchItems,
    /// Size of encoded payloads in bytes.
    PayloadBytes,
}

impl DistributionMetric for ChannelDistributions {
    fn name(&self) -> &'static str {
        match self {
            Self::BatchItems => "channel.batch.items",
            Self::PayloadBytes => "channel.batch.payload_bytes",
        }
    }
}
