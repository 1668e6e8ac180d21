use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Operation {
    percentage: f64,
    last_seen: Instant,
}

/// Pins the sampling percentage of running operations.
///
/// When the first item of an operation is sampled, the current percentage is recorded for its
/// correlation id. All later items of the same operation are sampled at the recorded percentage,
/// even if the adaptive controller has changed the percentage in the meantime. Together with the
/// shared score of the correlation id, this yields the same decision for the entire operation.
///
/// Entries are removed explicitly with [`end`](Self::end) when the operation completes, or
/// expire after a period without items.
#[derive(Debug)]
pub struct OperationRegistry {
    operations: HashMap<String, Operation>,
    ttl: Duration,
}

impl OperationRegistry {
    /// Creates an empty registry forgetting idle operations after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            operations: HashMap::new(),
            ttl,
        }
    }

    /// Returns the pinned percentage of an operation, pinning `current` if it is new.
    pub fn pin(&mut self, correlation_id: &str, current: f64, now: Instant) -> f64 {
        if let Some(operation) = self.operations.get_mut(correlation_id) {
            if now.saturating_duration_since(operation.last_seen) < self.ttl {
                operation.last_seen = now;
                return operation.percentage;
            }

            // Idle for too long, treat as a new operation.
            operation.percentage = current;
            operation.last_seen = now;
            return current;
        }

        self.operations.insert(
            correlation_id.to_owned(),
            Operation {
                percentage: current,
                last_seen: now,
            },
        );

        current
    }

    /// Removes the operation. Returns `true` if it was registered.
    pub fn end(&mut self, correlation_id: &str) -> bool {
        self.operations.remove(correlation_id).is_some()
    }

    /// Removes all operations idle for longer than the TTL and returns how many were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.operations.len();
        let ttl = self.ttl;
        self.operations
            .retain(|_, operation| now.saturating_duration_since(operation.last_seen) < ttl);
        before - self.operations.len()
    }

    /// Returns the number of tracked operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns `true` if no operations are tracked.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_keeps_first_percentage() {
        let now = Instant::now();
        let mut registry = OperationRegistry::new(Duration::from_secs(60));

        assert_eq!(registry.pin("op", 50.0, now), 50.0);
        assert_eq!(registry.pin("op", 10.0, now + Duration::from_secs(1)), 50.0);
        assert_eq!(registry.pin("other", 10.0, now), 10.0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_end_operation() {
        let now = Instant::now();
        let mut registry = OperationRegistry::new(Duration::from_secs(60));

        registry.pin("op", 50.0, now);
        assert!(registry.end("op"));
        assert!(!registry.end("op"));
        assert_eq!(registry.pin("op", 10.0, now), 10.0);
    }

    #[test]
    fn test_expire() {
        let now = Instant::now();
        let mut registry = OperationRegistry::new(Duration::from_secs(60));

        registry.pin("old", 50.0, now);
        registry.pin("new", 50.0, now + Duration::from_secs(30));

        assert_eq!(registry.expire(now + Duration::from_secs(61)), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pin("old", 10.0, now + Duration::from_secs(61)), 10.0);
    }
}
