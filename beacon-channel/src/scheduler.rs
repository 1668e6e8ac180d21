use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use beacon_common::RetryPolicy;
use beacon_config::Config;
use beacon_sampling::SamplingEngine;
use beacon_statsd::metric;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::buffer::ItemBuffer;
use crate::codec::Serializer;
use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::http::Transport;
use crate::item::TelemetryItem;
use crate::statsd::{ChannelCounters, ChannelDistributions, ChannelGauges, ChannelTimers};
use crate::store::OverflowStore;
use crate::throttle::ThrottleState;
use crate::transmission::{FailureReason, SendOutcome, TransmissionUnit};
use crate::utils::SleepHandle;

/// Summary of the transmissions handled by a channel, returned on shutdown.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ShutdownReport {
    /// Number of transmissions accepted by the endpoint.
    pub sent: usize,
    /// Number of records left in the overflow store for the next run.
    pub persisted: usize,
    /// Number of transmissions that were dropped permanently.
    pub dropped: usize,
}

/// Messages from the [`Channel`](crate::Channel) to its scheduler.
#[derive(Debug)]
pub enum Control {
    /// Dispatch everything in the buffer now.
    Flush,
    /// Flush, wait for transmissions in flight until the deadline, then stop.
    Shutdown {
        deadline: Instant,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

/// Result of a transmission task.
type Completed = (SendOutcome, Duration);

/// The background loop moving batches from the buffer to the endpoint.
///
/// The scheduler owns all transmissions. It starts at most `max_concurrent_requests` requests at
/// a time and only while the endpoint does not throttle. Everything that cannot be sent right
/// away, including failed transmissions waiting for their retry, goes to the overflow store and
/// is picked up from there oldest first.
pub struct Scheduler<T> {
    config: Arc<Config>,
    buffer: Arc<ItemBuffer>,
    sampling: Arc<SamplingEngine>,
    serializer: Arc<dyn Serializer>,
    transport: Arc<T>,
    store: Arc<OverflowStore>,
    diagnostics: Diagnostics,
    throttle: ThrottleState,
    retry_policy: RetryPolicy,
    max_concurrent: usize,
    inflight: JoinSet<Completed>,
    inflight_units: HashMap<Id, TransmissionUnit>,
    control_rx: mpsc::Receiver<Control>,
    wakeup: SleepHandle,
    report: ShutdownReport,
}

impl<T: Transport> Scheduler<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        buffer: Arc<ItemBuffer>,
        sampling: Arc<SamplingEngine>,
        serializer: Arc<dyn Serializer>,
        transport: T,
        store: Arc<OverflowStore>,
        diagnostics: Diagnostics,
        control_rx: mpsc::Receiver<Control>,
    ) -> Self {
        Self {
            throttle: ThrottleState::new(config.throttle_default(), config.throttle_max()),
            retry_policy: config.retry_policy(),
            max_concurrent: config.max_concurrent_requests().max(1),
            config,
            buffer,
            sampling,
            serializer,
            transport: Arc::new(transport),
            store,
            diagnostics,
            inflight: JoinSet::new(),
            inflight_units: HashMap::new(),
            control_rx,
            wakeup: SleepHandle::idle(),
            report: ShutdownReport::default(),
        }
    }

    /// Runs the scheduler until it receives a shutdown or the channel is dropped.
    pub async fn run(mut self) {
        beacon_log::info!("transmission scheduler started");

        // Records from a previous run go out before anything tracked since.
        self.drain_store().await;

        let now = Instant::now();
        let flush_interval = self.config.flush_interval();
        let mut flush_ticker = tokio::time::interval_at(now + flush_interval, flush_interval);
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let drain_interval = self.config.storage_drain_interval();
        let mut drain_ticker = tokio::time::interval_at(now + drain_interval, drain_interval);
        drain_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let evaluation_interval = self.config.sampling().adaptive.evaluation_interval();
        let mut evaluation_ticker =
            tokio::time::interval_at(now + evaluation_interval, evaluation_interval);
        evaluation_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Control messages first, so that shutdown is not delayed by a busy buffer.
                biased;

                control = self.control_rx.recv() => match control {
                    Some(Control::Flush) => self.flush_buffer("flush").await,
                    Some(Control::Shutdown { deadline, reply }) => {
                        let report = self.shutdown(deadline).await;
                        reply.send(report).ok();
                        break;
                    }
                    None => {
                        let deadline = Instant::now() + self.config.shutdown_timeout();
                        self.shutdown(deadline).await;
                        break;
                    }
                },
                Some(result) = self.inflight.join_next_with_id(), if !self.inflight.is_empty() => {
                    self.handle_joined(result).await;
                    self.drain_store().await;
                }
                () = self.buffer.ready() => {
                    while let Some(batch) = self.buffer.take_ready() {
                        self.dispatch_batch(batch, "full").await;
                    }
                }
                _ = flush_ticker.tick() => self.flush_buffer("interval").await,
                () = &mut self.wakeup => self.drain_store().await,
                _ = drain_ticker.tick() => self.drain_store().await,
                _ = evaluation_ticker.tick() => self.evaluate_sampling(),
            }
        }

        beacon_log::info!("transmission scheduler stopped");
    }

    fn can_dispatch(&self, now: Instant) -> bool {
        !self.throttle.is_blocked(now) && self.inflight.len() < self.max_concurrent
    }

    async fn flush_buffer(&mut self, trigger: &'static str) {
        while let Some(batch) = self.buffer.take_batch() {
            self.dispatch_batch(batch, trigger).await;
        }
    }

    async fn dispatch_batch(&mut self, batch: Vec<TelemetryItem>, trigger: &'static str) {
        metric!(counter(ChannelCounters::BatchesCreated) += 1, trigger = trigger);

        let sampled = self.sampling.sample_batch(batch, Instant::now().into_std());
        metric!(
            counter(ChannelCounters::ItemsDropped) += sampled.dropped as i64,
            reason = "sampled"
        );

        if sampled.kept.is_empty() {
            return;
        }

        let unit = match TransmissionUnit::from_items(
            &sampled.kept,
            self.serializer.as_ref(),
            self.config.http_encoding(),
        ) {
            Ok(unit) => unit,
            Err(error) => {
                beacon_log::error!(
                    error = &error as &dyn std::error::Error,
                    items = sampled.kept.len(),
                    "failed to serialize batch"
                );
                self.report_drop(
                    sampled.kept.len(),
                    0,
                    FailureReason::Payload(error.to_string()),
                    "invalid",
                );
                return;
            }
        };

        metric!(distribution(ChannelDistributions::BatchItems) = unit.item_count() as u64);
        metric!(distribution(ChannelDistributions::PayloadBytes) = unit.payload().len() as u64);

        self.submit(unit).await;
    }

    /// Starts the unit if possible, otherwise queues it in the overflow store.
    async fn submit(&mut self, unit: TransmissionUnit) {
        if self.can_dispatch(Instant::now()) {
            self.start(unit);
        } else {
            self.spill(unit, None).await;
        }
    }

    fn start(&mut self, unit: TransmissionUnit) {
        let transport = Arc::clone(&self.transport);
        let url = self.config.endpoint().clone();
        let timeout = self.config.http_timeout();
        let request = unit.clone();

        let handle = self.inflight.spawn(async move {
            let start = Instant::now();
            let outcome = request.send(transport.as_ref(), &url, timeout).await;
            (outcome, start.elapsed())
        });
        self.inflight_units.insert(handle.id(), unit);
        metric!(gauge(ChannelGauges::InflightTransmissions) = self.inflight.len() as u64);
    }

    async fn handle_joined(&mut self, result: Result<(Id, Completed), JoinError>) {
        match result {
            Ok((id, (outcome, duration))) => {
                if let Some(unit) = self.inflight_units.remove(&id) {
                    self.handle_completed(unit, outcome, duration).await;
                }
            }
            Err(error) => {
                beacon_log::error!(
                    error = &error as &dyn std::error::Error,
                    "transmission task failed"
                );
                // Releases the claim on the record, so it can be retried or evicted.
                if let Some(unit) = self.inflight_units.remove(&error.id()) {
                    self.retry(unit, FailureReason::Aborted(error.to_string())).await;
                }
            }
        }

        metric!(gauge(ChannelGauges::InflightTransmissions) = self.inflight.len() as u64);
    }

    async fn handle_completed(
        &mut self,
        mut unit: TransmissionUnit,
        outcome: SendOutcome,
        duration: Duration,
    ) {
        metric!(timer(ChannelTimers::SendDuration) = duration, result = outcome.name());
        metric!(
            counter(ChannelCounters::TransmissionOutcome) += 1,
            result = outcome.name()
        );

        match outcome {
            SendOutcome::Success => {
                self.throttle.reset();
                self.report.sent += 1;
                self.diagnostics.emit(DiagnosticEvent::SendSuccess {
                    items: unit.item_count(),
                    attempt: unit.attempt,
                });
                self.discard(&unit).await;
            }
            SendOutcome::PartialSuccess { retry, rejected } => {
                self.throttle.reset();
                self.report.sent += 1;

                if rejected > 0 {
                    self.report_drop(rejected, unit.attempt, FailureReason::Rejected, "rejected");
                }

                let retry_unit = unit.select(&retry);
                self.discard(&unit).await;

                match retry_unit {
                    Ok(Some(retry_unit)) => {
                        self.retry(retry_unit, FailureReason::Status(206)).await;
                    }
                    Ok(None) => {}
                    Err(error) => self.report_drop(
                        retry.len(),
                        unit.attempt,
                        FailureReason::Payload(error.to_string()),
                        "invalid",
                    ),
                }
            }
            SendOutcome::RetryableFailure(reason) => self.retry(unit, reason).await,
            SendOutcome::NonRetryableFailure(reason) => {
                unit.last_failure = Some(reason.clone());
                self.drop_unit(unit, reason, "rejected").await;
            }
            SendOutcome::PayloadTooLarge => self.split(unit).await,
            SendOutcome::Throttled(retry_after) => {
                let delay = self.throttle.throttle(retry_after, Instant::now());
                self.diagnostics.emit(DiagnosticEvent::Throttled { delay });
                // Throttling applies to all transmissions and does not count as an attempt.
                self.spill(unit, None).await;
            }
        }
    }

    /// Schedules another attempt after the backoff, or drops the unit once retries are exhausted.
    async fn retry(&mut self, mut unit: TransmissionUnit, reason: FailureReason) {
        unit.attempt += 1;
        unit.last_failure = Some(reason.clone());

        if self.retry_policy.is_exhausted(unit.attempt) {
            self.drop_unit(unit, reason, "retries_exhausted").await;
            return;
        }

        let delay = self.retry_policy.delay(unit.attempt);
        self.diagnostics.emit(DiagnosticEvent::SendRetry {
            items: unit.item_count(),
            attempt: unit.attempt,
            reason,
            delay,
        });

        self.spill(unit, Some(Instant::now() + delay)).await;
    }

    async fn split(&mut self, unit: TransmissionUnit) {
        match unit.split() {
            Ok(Some((left, right))) => {
                beacon_log::debug!(
                    items = unit.item_count(),
                    "payload too large, splitting transmission"
                );
                self.discard(&unit).await;
                self.submit(left).await;
                self.submit(right).await;
            }
            Ok(None) => {
                self.drop_unit(unit, FailureReason::Status(413), "too_large").await;
            }
            Err(error) => {
                let reason = FailureReason::Payload(error.to_string());
                self.drop_unit(unit, reason, "invalid").await;
            }
        }
    }

    /// Writes the unit to the overflow store, or updates its record if it has one.
    async fn spill(&mut self, unit: TransmissionUnit, not_before: Option<Instant>) {
        let header = unit.record_header();

        let result = match unit.record {
            Some(id) => self
                .store
                .release(id, &header, unit.payload(), not_before)
                .await
                .map(|()| None),
            None => self
                .store
                .persist(&header, unit.payload(), not_before)
                .await
                .map(Some),
        };

        match result {
            Ok(Some(outcome)) if outcome.evicted_records > 0 => {
                self.diagnostics.emit(DiagnosticEvent::OverflowQuotaEvicted {
                    records: outcome.evicted_records,
                    bytes: outcome.evicted_bytes,
                });
            }
            Ok(_) => {}
            Err(error) => {
                beacon_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to write transmission to overflow store"
                );
                let reason = FailureReason::Storage(error.to_string());
                self.drop_unit(unit, reason, "store_full").await;
            }
        }

        self.schedule_wakeup().await;
    }

    /// Removes the record backing a unit that needs no further attempts.
    async fn discard(&self, unit: &TransmissionUnit) {
        let Some(id) = unit.record else {
            return;
        };

        if let Err(error) = self.store.delete(id).await {
            beacon_log::error!(
                error = &error as &dyn std::error::Error,
                record = %id,
                "failed to delete overflow record"
            );
        }
    }

    async fn drop_unit(&mut self, unit: TransmissionUnit, reason: FailureReason, tag: &str) {
        self.report.dropped += 1;
        self.report_drop(unit.item_count(), unit.attempt, reason, tag);
        self.discard(&unit).await;
    }

    fn report_drop(&self, items: usize, attempt: u32, reason: FailureReason, tag: &str) {
        metric!(
            counter(ChannelCounters::ItemsDropped) += items as i64,
            reason = tag
        );
        self.diagnostics.emit(DiagnosticEvent::SendPermanentFailure {
            items,
            attempt,
            reason,
        });
    }

    /// Starts transmissions from the overflow store while capacity allows.
    async fn drain_store(&mut self) {
        while self.can_dispatch(Instant::now()) {
            match self.store.claim_next(Instant::now()).await {
                Ok(Some(record)) => self.start(TransmissionUnit::from_record(record)),
                Ok(None) => break,
                Err(error) => {
                    beacon_log::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to read from overflow store"
                    );
                    break;
                }
            }
        }

        self.schedule_wakeup().await;
    }

    /// Arms the wakeup for the end of a throttling pause or the next pending retry.
    async fn schedule_wakeup(&mut self) {
        let now = Instant::now();
        let deadline = match self.throttle.blocked_until() {
            Some(until) if until > now => Some(until),
            _ => self.store.next_retry_after(now).await,
        };

        match deadline {
            Some(deadline) => self.wakeup.set_until(deadline),
            None => self.wakeup.reset(),
        }
    }

    fn evaluate_sampling(&mut self) {
        if let Some(change) = self.sampling.evaluate(Instant::now().into_std()) {
            self.diagnostics.emit(DiagnosticEvent::SamplingRateChanged {
                previous: change.previous,
                current: change.current,
            });
        }
    }

    async fn shutdown(&mut self, deadline: Instant) -> ShutdownReport {
        beacon_log::debug!("flushing channel for shutdown");
        self.flush_buffer("shutdown").await;

        while !self.inflight.is_empty() {
            match tokio::time::timeout_at(deadline, self.inflight.join_next_with_id()).await {
                Ok(Some(result)) => self.handle_joined(result).await,
                Ok(None) => break,
                Err(_) => {
                    beacon_log::warn!(
                        inflight = self.inflight.len(),
                        "shutdown timeout reached, persisting pending transmissions"
                    );
                    break;
                }
            }
        }

        self.inflight.abort_all();
        let units: Vec<_> = self.inflight_units.drain().map(|(_, unit)| unit).collect();
        for unit in units {
            // Claimed records are still on disk and will be picked up by the next run.
            if unit.record.is_none() {
                self.spill(unit, None).await;
            }
        }

        self.report.persisted = self.store.len().await;
        beacon_log::info!(
            sent = self.report.sent,
            persisted = self.report.persisted,
            dropped = self.report.dropped,
            "channel shut down"
        );

        self.report
    }
}
