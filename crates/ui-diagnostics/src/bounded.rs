// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity FIFO buffer with drop-oldest eviction.

use std::collections::VecDeque;

/// Ordered buffer that never holds more than `capacity` items.
///
/// Pushing into a full buffer evicts from the front, so the retained items are
/// always the most recent ones in insertion order.
#[derive(Debug, Clone)]
pub struct BoundedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedBuffer<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        self.evict_excess();
    }

    /// Change the capacity, evicting the oldest items in one pass if needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict_excess();
    }

    fn evict_excess(&mut self) {
        if self.items.len() > self.capacity {
            let excess = self.items.len() - self.capacity;
            self.items.drain(..excess);
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// The `n` most recent items, oldest first.
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }
}

impl<T: Clone> BoundedBuffer<T> {
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_evicts_oldest_first() {
        let mut buffer = BoundedBuffer::new(120);
        for i in 0..200 {
            buffer.push(i);
        }
        assert_eq!(buffer.len(), 120);
        assert_eq!(buffer.iter().next(), Some(&80));
        assert_eq!(buffer.iter().next_back(), Some(&199));
    }

    #[test]
    fn test_shrinking_capacity_drops_front_in_one_pass() {
        let mut buffer = BoundedBuffer::new(10);
        for i in 1..=8 {
            buffer.push(i);
        }
        buffer.set_capacity(5);
        assert_eq!(buffer.to_vec(), vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_last_n() {
        let mut buffer = BoundedBuffer::new(10);
        for i in 0..6 {
            buffer.push(i);
        }
        assert_eq!(buffer.last_n(3).copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(buffer.last_n(100).count(), 6);
        assert_eq!(buffer.last_n(0).count(), 0);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity_and_keeps_newest(
            capacity in 1usize..64,
            values in proptest::collection::vec(any::<u32>(), 0..256),
        ) {
            let mut buffer = BoundedBuffer::new(capacity);
            for value in &values {
                buffer.push(*value);
            }
            prop_assert!(buffer.len() <= capacity);
            let expected: Vec<u32> = values
                .iter()
                .skip(values.len().saturating_sub(capacity))
                .copied()
                .collect();
            prop_assert_eq!(buffer.to_vec(), expected);
        }
    }
}
