//! Fixed-capacity ring buffer for sliding observation windows.
//!
//! Storage is allocated once at construction; pushing into a full buffer
//! overwrites the oldest slot. Logical index 0 is always the oldest element.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Next slot to write.
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer. A capacity of zero is bumped to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Push a value, returning the evicted oldest value when full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let capacity = self.capacity();
        let evicted = self.slots[self.head].replace(value);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
        evicted
    }

    fn physical(&self, index: usize) -> usize {
        let capacity = self.capacity();
        (self.head + capacity - self.len + index) % capacity
    }

    /// Element at logical `index` (0 = oldest).
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.slots[self.physical(index)].as_ref()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn newest(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|idx| self.get(idx))
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |idx| self.get(idx))
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut ring = RingBuffer::with_capacity(3);
        assert_eq!(ring.push(1), None);
        ring.push(2);
        ring.push(3);
        assert!(ring.is_full());
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.oldest(), Some(&2));
        assert_eq!(ring.newest(), Some(&4));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn logical_indexing_wraps() {
        let mut ring = RingBuffer::with_capacity(2);
        for value in 0..5 {
            ring.push(value);
        }
        assert_eq!(ring.get(0), Some(&3));
        assert_eq!(ring.get(1), Some(&4));
        assert_eq!(ring.get(2), None);
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let mut ring = RingBuffer::with_capacity(0);
        ring.push('a');
        ring.push('b');
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.newest(), Some(&'b'));
    }

    #[test]
    fn clear_resets() {
        let mut ring = RingBuffer::with_capacity(4);
        ring.push(1.0);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.newest(), None);
    }
}
