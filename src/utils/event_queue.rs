use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Bounded hand-off queue between a producer thread and one consumer.
///
/// Producers never block: when full, the oldest buffered event is dropped
/// to make room for the new one.
pub struct EventQueue<T> {
    buffer: Mutex<VecDeque<T>>,
    max_entries: usize,
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(max_entries.min(DEFAULT_QUEUE_SIZE))),
            max_entries,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn put(&self, event: T) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                warn!("Event queue overflow: dropped {} events total", dropped);
            }
        }
        buffer.push_back(event);
    }

    /// Next buffered event, without waiting
    pub fn next_event(&self) -> Option<T> {
        self.buffer.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}
