//! A StatsD client for the internal measurements of the telemetry pipeline, built on cadence.
//!
//! ## Defining Metrics
//!
//! Metrics are declared as enums implementing one of the metric traits: [`CounterMetric`],
//! [`GaugeMetric`], [`DistributionMetric`] or [`TimerMetric`]. The traits only provide a type safe
//! metric name, so that a counter cannot accidentally be emitted as a timer.
//!
//! ## Initializing the Client
//!
//! Metrics can be emitted without a configured client. In that case, the [`metric!`] macro is a
//! noop. Call [`init`] with a [`MetricsClientConfig`] to report to a StatsD server.
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! # use beacon_statsd::MetricsClientConfig;
//! beacon_statsd::init(MetricsClientConfig {
//!     prefix: "beacon",
//!     host: "localhost:8125",
//!     default_tags: BTreeMap::new(),
//!     default_sample_rate: 1.0.into(),
//! });
//! ```
//!
//! ## Macro Usage
//!
//! ```
//! use beacon_statsd::{metric, CounterMetric};
//!
//! enum ChannelCounters {
//!     ItemsTracked,
//! }
//!
//! impl CounterMetric for ChannelCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::ItemsTracked => "channel.items.tracked",
//!         }
//!     }
//! }
//!
//! metric!(counter(ChannelCounters::ItemsTracked) += 1, kind = "request");
//! ```
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::Arc;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};
use parking_lot::RwLock;
use rand::Rng;
use rand::distr::StandardUniform;

/// Maximum number of metric events that can be queued before we start dropping them.
const METRICS_MAX_QUEUE_SIZE: usize = 100_000;

/// A sample rate clamped to the range `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct SampleRate(f64);

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

impl From<SampleRate> for f64 {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

/// Client configuration object to store globally.
#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Default tags to apply to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Global sample rate.
    pub default_sample_rate: SampleRate,
}

/// Client configuration used for initialization of [`MetricsClient`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a, A> {
    /// Prefix which is prepended to all metric names.
    pub prefix: &'a str,
    /// Host of the StatsD server.
    pub host: A,
    /// Tags that are added to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Default sample rate for metrics, between 0.0 (= 0%) and 1.0 (= 100%).
    pub default_sample_rate: SampleRate,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Send a metric with the default tags defined on this `MetricsClient`.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.send_metric_with_sample_rate(metric, None)
    }

    /// Send a metric with an explicit sample rate, capped by the global sample rate.
    #[doc(hidden)]
    #[inline(always)]
    pub fn send_metric_with_sample_rate<'a, T>(
        &'a self,
        mut metric: MetricBuilder<'a, '_, T>,
        sample_rate: Option<SampleRate>,
    ) where
        T: Metric + From<String>,
    {
        let effective_sample_rate = match sample_rate {
            Some(sample_rate) => sample_rate.0.min(self.default_sample_rate.0),
            None => self.default_sample_rate.0,
        };

        if !Self::should_send(effective_sample_rate) {
            return;
        }

        for (k, v) in &self.default_tags {
            metric = metric.with_tag(k, v);
        }

        if effective_sample_rate < 1.0 {
            metric = metric.with_sampling_rate(effective_sample_rate);
        }

        if let Err(error) = metric.try_send() {
            beacon_log::error!(
                maximum_capacity = METRICS_MAX_QUEUE_SIZE,
                "error sending a metric: {}",
                beacon_log::LogError(&error),
            );
        }
    }

    fn should_send(sample_rate: f64) -> bool {
        if sample_rate <= 0.0 {
            false
        } else if sample_rate >= 1.0 {
            true
        } else {
            let s: f64 = rand::rng().sample(StandardUniform);
            s <= sample_rate
        }
    }
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    static CURRENT_CLIENT: std::cell::RefCell<Option<Arc<MetricsClient>>> =
        METRICS_CLIENT.read().clone().into();
}

/// Internal prelude for the macro.
#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Set a new statsd client.
pub fn set_client(client: MetricsClient) {
    *METRICS_CLIENT.write() = Some(Arc::new(client));
    CURRENT_CLIENT.with(|cell| cell.replace(METRICS_CLIENT.read().clone()));
}

/// Set a test client for the period of the called function (only affects the current thread).
///
/// Returns all metrics emitted by the function in StatsD line format.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let test_client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: Default::default(),
        default_sample_rate: 1.0.into(),
    };

    CURRENT_CLIENT.with(|cell| {
        let old_client = cell.replace(Some(Arc::new(test_client)));
        f();
        cell.replace(old_client);
    });

    rx.iter()
        .map(|x| String::from_utf8_lossy(&x).into_owned())
        .collect()
}

/// Tell the metrics system to report to statsd.
///
/// Metrics are buffered into UDP datagrams and sent from a background thread, so emitting a
/// metric never blocks the calling thread on network I/O.
pub fn init<A: ToSocketAddrs>(config: MetricsClientConfig<A>) {
    let addrs: Vec<_> = match config.host.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(error) => {
            beacon_log::error!("failed to resolve statsd host: {}", beacon_log::LogError(&error));
            return;
        }
    };

    let Some(addr) = addrs.first().copied() else {
        beacon_log::error!("statsd host did not resolve to any address");
        return;
    };

    beacon_log::info!("reporting metrics to statsd at {addr}");

    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => socket,
        Err(error) => {
            beacon_log::error!("failed to bind statsd socket: {}", beacon_log::LogError(&error));
            return;
        }
    };

    if let Err(error) = socket.set_nonblocking(true) {
        beacon_log::warn!("failed to make statsd socket non-blocking: {}", beacon_log::LogError(&error));
    }

    let udp_sink = match BufferedUdpMetricSink::from(addr, socket) {
        Ok(sink) => sink,
        Err(error) => {
            beacon_log::error!("failed to create statsd sink: {}", beacon_log::LogError(&error));
            return;
        }
    };

    let sample_rate: f64 = config.default_sample_rate.into();
    if sample_rate == 0.0 {
        beacon_log::debug!("metrics sample rate is 0, no metrics will be reported");
    }

    let sink = QueuingMetricSink::with_capacity(udp_sink, METRICS_MAX_QUEUE_SIZE);

    set_client(MetricsClient {
        statsd_client: StatsdClient::from_sink(config.prefix, sink),
        default_tags: config.default_tags,
        default_sample_rate: config.default_sample_rate,
    });
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part the [`metric!`]
/// macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| {
        if let Some(client) = client.borrow().as_deref() {
            f(client)
        } else {
            R::default()
        }
    })
}

/// A metric for capturing timings in milliseconds.
///
/// ```
/// use std::time::Instant;
/// use beacon_statsd::{metric, TimerMetric};
///
/// struct SendDuration;
///
/// impl TimerMetric for SendDuration {
///     fn name(&self) -> &'static str {
///         "transmission.send.duration"
///     }
/// }
///
/// let start = Instant::now();
/// metric!(timer(SendDuration) = start.elapsed(), result = "success");
///
/// let bytes = metric!(timer(SendDuration), { vec![0u8; 16] });
/// # assert_eq!(bytes.len(), 16);
/// ```
pub trait TimerMetric {
    /// Returns the timer metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing counters.
///
/// Counters are incremented or decremented by the client. The server receiving them derives
/// rates from the increments.
pub trait CounterMetric {
    /// Returns the counter metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing distributions, such as batch sizes.
pub trait DistributionMetric {
    /// Returns the distribution metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing gauges.
///
/// Gauge values are an instantaneous measurement of a value determined by the client, such as the
/// number of records held by the overflow store.
pub trait GaugeMetric {
    /// Returns the gauge metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// Emits a metric.
///
/// See [crate-level documentation](self) for examples.
#[macro_export]
macro_rules! metric {
    // counter increment
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            value if value != 0 => {
                $crate::with_client(|client| {
                    use $crate::_pred::*;
                    client.send_metric(
                        client.count_with_tags(&$crate::CounterMetric::name(&$id), value)
                        $(.with_tag(stringify!($($k).*), $v))*
                    )
                })
            },
            _ => {},
        };
    };

    // gauge set
    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags(&$crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // distribution
    (distribution($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.distribution_with_tags(&$crate::DistributionMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timer value
    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                // Durations are reported in milliseconds.
                client.distribution_with_tags(&$crate::TimerMetric::name(&$id), $value.as_nanos() as f64 / 1e6)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timed block
    (timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let now = std::time::Instant::now();
        let rv = {$block};
        $crate::metric!(timer($id) = now.elapsed() $(, $($k).* = $v)*);
        rv
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    enum TestCounters {
        Sent,
    }

    impl CounterMetric for TestCounters {
        fn name(&self) -> &'static str {
            match self {
                Self::Sent => "sent",
            }
        }
    }

    struct TestGauge;

    impl GaugeMetric for TestGauge {
        fn name(&self) -> &'static str {
            "records"
        }
    }

    struct TestTimer;

    impl TimerMetric for TestTimer {
        fn name(&self) -> &'static str {
            "send"
        }
    }

    #[test]
    fn test_capturing_client() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(TestCounters::Sent) += 3, result = "success");
            metric!(gauge(TestGauge) = 12u64);
        });

        assert_eq!(captures, ["sent:3|c|#result:success", "records:12|g"]);
    }

    #[test]
    fn test_zero_counter_is_skipped() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(TestCounters::Sent) += 0);
        });

        assert!(captures.is_empty());
    }

    #[test]
    fn test_timer_milliseconds() {
        let captures = with_capturing_test_client(|| {
            metric!(timer(TestTimer) = Duration::from_millis(250));
        });

        assert_eq!(captures, ["send:250|d"]);
    }

    #[test]
    fn test_noop_without_client() {
        // Must not panic when no client is configured on this thread.
        metric!(counter(TestCounters::Sent) += 1);
        let value: u32 = with_client(|_| 1);
        assert_eq!(value, 0);
    }
}
