use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::item::TelemetryItem;

/// The result of [`ItemBuffer::push`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PushOutcome {
    /// The item was added to the current batch.
    Added,
    /// The item was added and completed a batch, which is now ready for transmission.
    BatchReady {
        /// Number of items in the completed batch.
        items: usize,
    },
    /// The buffer and all pending batches are full, the item was dropped.
    Dropped {
        /// Number of items dropped by this buffer so far.
        total: u64,
    },
}

#[derive(Debug, Default)]
struct BufferState {
    current: Vec<TelemetryItem>,
    current_size: usize,
    pending: VecDeque<Vec<TelemetryItem>>,
    dropped: u64,
}

/// Bounded holding area for items submitted by producers.
///
/// Items are appended to the current batch. Once the batch reaches its item or size limit, it is
/// moved to a queue of pending batches and the scheduler is notified. If the scheduler falls so far
/// behind that the pending queue is full as well, new items are dropped.
///
/// The buffer does not consult the overflow store before dropping. The scheduler hands every
/// batch it cannot send right away to the store, including while the endpoint throttles, so the
/// pending queue only fills up when the scheduler itself cannot keep up with producers.
///
/// All operations take a single lock for a short, non-blocking critical section.
#[derive(Debug)]
pub struct ItemBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
    max_items: usize,
    max_size: usize,
    max_pending: usize,
}

impl ItemBuffer {
    /// Creates an empty buffer.
    pub fn new(max_items: usize, max_size: usize, max_pending: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
            max_items: max_items.max(1),
            max_size: max_size.max(1),
            max_pending: max_pending.max(1),
        }
    }

    fn is_full(&self, state: &BufferState) -> bool {
        state.current.len() >= self.max_items || state.current_size >= self.max_size
    }

    /// Moves the current batch to the pending queue if there is space.
    fn try_complete(&self, state: &mut BufferState) -> Option<usize> {
        if state.pending.len() >= self.max_pending {
            return None;
        }

        let batch = std::mem::take(&mut state.current);
        state.current_size = 0;
        let items = batch.len();
        state.pending.push_back(batch);
        Some(items)
    }

    /// Appends an item.
    pub fn push(&self, item: TelemetryItem) -> PushOutcome {
        let size = item.estimated_size();

        let outcome = {
            let mut state = self.state.lock();

            // A full batch could not be completed earlier because the pending queue was full.
            let mut completed = None;
            if self.is_full(&state) {
                completed = self.try_complete(&mut state);
                if completed.is_none() {
                    state.dropped += 1;
                    return PushOutcome::Dropped {
                        total: state.dropped,
                    };
                }
            }

            state.current.push(item);
            state.current_size += size;

            if completed.is_none() && self.is_full(&state) {
                completed = self.try_complete(&mut state);
            }

            match completed {
                Some(items) => PushOutcome::BatchReady { items },
                None => PushOutcome::Added,
            }
        };

        if matches!(outcome, PushOutcome::BatchReady { .. }) {
            self.notify.notify_one();
        }

        outcome
    }

    /// Removes and returns the oldest completed batch.
    pub fn take_ready(&self) -> Option<Vec<TelemetryItem>> {
        self.state.lock().pending.pop_front()
    }

    /// Removes and returns the oldest batch, including the incomplete current batch.
    ///
    /// Returns `None` if the buffer is empty.
    pub fn take_batch(&self) -> Option<Vec<TelemetryItem>> {
        let mut state = self.state.lock();
        if let Some(batch) = state.pending.pop_front() {
            return Some(batch);
        }

        if state.current.is_empty() {
            return None;
        }

        state.current_size = 0;
        Some(std::mem::take(&mut state.current))
    }

    /// Waits until a batch has been completed by a producer.
    pub async fn ready(&self) {
        self.notify.notified().await
    }

    /// Returns the number of items held, including pending batches.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.current.len() + state.pending.iter().map(Vec::len).sum::<usize>()
    }

    /// Returns `true` if the buffer holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of items dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}
