//! Fixed-capacity history buffer with oldest-first eviction.
//!
//! [`RingBuffer`] backs both capture channels. Memory stays bounded no matter
//! how many events the host process emits: once the buffer is full, every
//! push evicts the oldest element.
//!
//! # Example
//!
//! ```rust
//! use server_devtools::ring_buffer::RingBuffer;
//!
//! let mut buffer = RingBuffer::new(3);
//! for value in 1..=4 {
//!     buffer.push(value);
//! }
//!
//! assert_eq!(buffer.snapshot(), vec![2, 3, 4]);
//! ```

use std::collections::VecDeque;

/// An append-only sequence that never holds more than `capacity` items.
///
/// Items are kept in insertion order. The buffer itself is not synchronized;
/// callers that share it across threads wrap it in a lock (see
/// [`EventCollector`](crate::collector::EventCollector)).
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` items.
    ///
    /// A capacity of 0 is clamped to 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            // Large histories grow on demand instead of reserving up front.
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends an item, evicting the oldest one when the buffer is full.
    ///
    /// Returns the evicted item, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Returns the number of items currently held.
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the buffer holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the maximum number of items the buffer retains.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over the items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Returns a copy of the contents, oldest first.
    ///
    /// The returned vector is independent of the buffer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}
