//! Channel buffers for windowed flow control.
//!
//! A `ChannelBuffer` is a FIFO queue paired with a capacity counter. The
//! inbound buffer of a channel counts how many more events the local side
//! has promised to accept; the outbound buffer counts how many more events
//! the peer is believed to accept. The counter is managed by the caller and
//! may go negative when a peer over-commits.

use std::collections::VecDeque;

/// Default inbound window advertised to peers
pub const DEFAULT_WINDOW: usize = 100;

/// Remote capacity assumed before the peer advertises its window
pub const DEFAULT_REMOTE_CAPACITY: i64 = 1;

/// Bounded FIFO queue with an externally managed permit count
///
/// No operation blocks. Callers check `has_capacity` and `len` before
/// relying on a send or a delivery.
#[derive(Debug, Clone)]
pub struct ChannelBuffer<T> {
    items: VecDeque<T>,
    capacity: i64,
    max_capacity: usize,
}

impl<T> ChannelBuffer<T> {
    /// Create a buffer whose window and initial capacity are `max_capacity`
    pub fn new(max_capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(max_capacity),
            capacity: max_capacity as i64,
            max_capacity,
        }
    }

    /// Create a buffer with a window of `max_capacity` but a different starting capacity
    pub fn with_capacity(max_capacity: usize, capacity: i64) -> Self {
        Self {
            capacity,
            ..Self::new(max_capacity)
        }
    }

    /// Queue an item at the back
    pub fn add(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Take the oldest item
    pub fn remove(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Number of queued, not yet delivered items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every queued item, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    /// Remaining permitted sends or receives
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: i64) {
        self.capacity = capacity;
    }

    pub fn decrement_capacity(&mut self) {
        self.capacity -= 1;
    }

    pub fn has_capacity(&self) -> bool {
        self.capacity > 0
    }

    /// The advertised window size
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }
}

impl<T> Default for ChannelBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut buffer = ChannelBuffer::new(4);
        buffer.add(1);
        buffer.add(2);
        buffer.add(3);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.remove(), Some(1));
        assert_eq!(buffer.remove(), Some(2));
        assert_eq!(buffer.remove(), Some(3));
        assert_eq!(buffer.remove(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_is_independent_of_length() {
        let mut buffer: ChannelBuffer<u8> = ChannelBuffer::with_capacity(100, DEFAULT_REMOTE_CAPACITY);
        assert!(buffer.has_capacity());

        buffer.decrement_capacity();
        assert!(!buffer.has_capacity());
        assert_eq!(buffer.len(), 0);

        // Over-commitment goes negative
        buffer.decrement_capacity();
        assert_eq!(buffer.capacity(), -1);

        buffer.set_capacity(50);
        assert_eq!(buffer.capacity(), 50);
        assert_eq!(buffer.max_capacity(), 100);
    }

    #[test]
    fn test_clear() {
        let mut buffer = ChannelBuffer::new(2);
        buffer.add("a");
        buffer.add("b");

        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
    }
}
