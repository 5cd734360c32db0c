//! Fixed-capacity ring buffer.

use std::collections::VecDeque;

use serde::Serialize;

/// An append-only log that keeps the most recent `capacity` entries.
///
/// Pushing into a full log evicts the oldest entry.
#[derive(Debug, Clone, Serialize)]
pub struct BoundedLog<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedLog<T> {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Appends `item`, returning the evicted entry if the log was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Most recently pushed entry matching `pred`.
    pub fn find_latest(&self, pred: impl Fn(&T) -> bool) -> Option<&T> {
        self.items.iter().rev().find(|item| pred(item))
    }
}

impl<T: Clone> BoundedLog<T> {
    /// Up to `n` most recent entries, newest first.
    pub fn latest(&self, n: usize) -> Vec<T> {
        self.items.iter().rev().take(n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_first() {
        let mut log = BoundedLog::new(2);
        assert_eq!(log.push(1), None);
        assert_eq!(log.push(2), None);
        assert_eq!(log.push(3), Some(1));

        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(log.latest(5), vec![3, 2]);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut log = BoundedLog::new(0);
        log.push("a");
        log.push("b");
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.latest(1), vec!["b"]);
    }

    #[test]
    fn test_find_latest() {
        let mut log = BoundedLog::new(4);
        for (k, v) in [("a", 1), ("b", 2), ("a", 3)] {
            log.push((k, v));
        }
        assert_eq!(log.find_latest(|(k, _)| *k == "a"), Some(&("a", 3)));
        assert!(log.find_latest(|(k, _)| *k == "z").is_none());
    }
}
