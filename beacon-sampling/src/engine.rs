use std::time::{Duration, Instant};

use beacon_common::TelemetryKind;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::adaptive::{AdaptiveController, RateChange};
use crate::config::{SamplingConfig, SamplingMode};
use crate::evaluation::{SamplingDecision, SamplingSeed};
use crate::operations::OperationRegistry;

/// An item the [`SamplingEngine`] can decide on.
pub trait Samplable {
    /// Returns the kind of the item.
    fn kind(&self) -> TelemetryKind;

    /// Returns the id of the operation the item belongs to, if any.
    fn correlation_id(&self) -> Option<&str>;

    /// Returns the unique identity of the item.
    fn identity(&self) -> Uuid;

    /// Returns `false` if the producer excluded this item from sampling.
    fn is_samplable(&self) -> bool {
        true
    }

    /// Returns the percentage the item has already been sampled at.
    fn sample_rate(&self) -> Option<f64>;

    /// Records the percentage the item was sampled at.
    fn set_sample_rate(&mut self, percentage: f64);
}

/// The result of [`SamplingEngine::sample_batch`].
#[derive(Debug)]
pub struct SampledBatch<T> {
    /// Items that survived sampling, in their original order.
    pub kept: Vec<T>,
    /// Number of items dropped by sampling.
    pub dropped: usize,
}

#[derive(Debug)]
struct EngineState {
    percentage: f64,
    controller: Option<AdaptiveController>,
    operations: OperationRegistry,
    observed: u64,
}

/// Decides which items of a batch are kept.
///
/// The engine is shared between the scheduler, which samples batches and triggers evaluations,
/// and producers ending operations. All state is behind a single short-held lock.
#[derive(Debug)]
pub struct SamplingEngine {
    config: SamplingConfig,
    state: Mutex<EngineState>,
}

impl SamplingEngine {
    /// Creates a new engine from configuration.
    pub fn new(config: SamplingConfig, now: Instant) -> Self {
        let (percentage, controller) = match config.mode {
            SamplingMode::Disabled => (100.0, None),
            SamplingMode::Fixed => (config.percentage.clamp(0.0, 100.0), None),
            SamplingMode::Adaptive => {
                let controller = AdaptiveController::new(config.adaptive.clone(), now);
                (controller.percentage(), Some(controller))
            }
        };

        let state = EngineState {
            percentage,
            controller,
            operations: OperationRegistry::new(config.adaptive.operation_ttl()),
            observed: 0,
        };

        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Returns the percentage currently applied to new operations.
    pub fn percentage(&self) -> f64 {
        self.state.lock().percentage
    }

    /// Returns the interval between adaptive evaluations, or `None` if not in adaptive mode.
    pub fn evaluation_interval(&self) -> Option<Duration> {
        match self.config.mode {
            SamplingMode::Adaptive => Some(self.config.adaptive.evaluation_interval()),
            _ => None,
        }
    }

    /// Samples a batch, annotating every kept item with the percentage it was sampled at.
    pub fn sample_batch<T: Samplable>(&self, batch: Vec<T>, now: Instant) -> SampledBatch<T> {
        if self.config.mode == SamplingMode::Disabled {
            return SampledBatch {
                kept: batch,
                dropped: 0,
            };
        }

        let mut state = self.state.lock();
        let mut kept = Vec::with_capacity(batch.len());
        let mut dropped = 0;

        for mut item in batch {
            match self.decide(&mut state, &item, now) {
                Some(decision) if decision.should_drop() => dropped += 1,
                Some(decision) => {
                    if decision.percentage < 100.0 {
                        item.set_sample_rate(decision.percentage);
                    }
                    kept.push(item);
                }
                None => kept.push(item),
            }
        }

        SampledBatch { kept, dropped }
    }

    /// Returns `None` for items that bypass sampling.
    fn decide<T: Samplable>(
        &self,
        state: &mut EngineState,
        item: &T,
        now: Instant,
    ) -> Option<SamplingDecision> {
        if !item.is_samplable() || !self.config.is_samplable_kind(item.kind()) {
            return None;
        }

        // Sampled before entering the channel, for instance by an upstream component.
        if item.sample_rate().is_some_and(|rate| rate < 100.0) {
            return None;
        }

        state.observed += 1;

        let (percentage, seed) = match item.correlation_id() {
            Some(id) => {
                let current = state.percentage;
                let percentage = state.operations.pin(id, current, now);
                (percentage, SamplingSeed::from_correlation_id(id))
            }
            None => (state.percentage, SamplingSeed::from_identity(item.identity())),
        };

        Some(SamplingDecision::new(percentage, seed))
    }

    /// Marks an operation as complete, releasing its pinned percentage.
    pub fn end_operation(&self, correlation_id: &str) -> bool {
        self.state.lock().operations.end(correlation_id)
    }

    /// Runs an evaluation of the adaptive controller and expires idle operations.
    ///
    /// Returns the change of the percentage, if any. Outside of adaptive mode, this only expires
    /// operations.
    pub fn evaluate(&self, now: Instant) -> Option<RateChange> {
        let mut state = self.state.lock();
        let expired = state.operations.expire(now);
        if expired > 0 {
            beacon_log::trace!(expired, "expired idle operations");
        }

        let observed = std::mem::take(&mut state.observed);
        let change = state.controller.as_mut()?.evaluate(observed, now)?;
        state.percentage = change.current;
        Some(change)
    }
}
