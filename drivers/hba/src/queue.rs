//! # FIFO Queues
//!
//! The wait, active and administrative-wait queues are all instances of
//! [`Queue`]. Each keeps an explicit count next to its entries so queue
//! corruption is detectable.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Ordered FIFO collection with an explicit count
#[derive(Debug)]
pub struct Queue<T> {
    entries: VecDeque<T>,
    count: usize,
}

impl<T> Queue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self { entries: VecDeque::new(), count: 0 }
    }

    /// Create an empty queue with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), count: 0 }
    }

    /// Push to back
    pub fn push_back(&mut self, entry: T) {
        self.entries.push_back(entry);
        self.count += 1;
    }

    /// Push to front, keeping a re-queued entry ahead of later arrivals
    pub fn push_front(&mut self, entry: T) {
        self.entries.push_front(entry);
        self.count += 1;
    }

    /// Pop from front
    pub fn pop_front(&mut self) -> Option<T> {
        let entry = self.entries.pop_front();
        if entry.is_some() {
            self.count -= 1;
        }
        entry
    }

    /// Peek at front
    pub fn peek(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Remove the first entry matching `predicate`
    pub fn remove<P>(&mut self, mut predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        let pos = self.entries.iter().position(|e| predicate(e))?;
        let entry = self.entries.remove(pos);
        if entry.is_some() {
            self.count -= 1;
        }
        entry
    }

    /// Remove every entry, front first
    pub fn drain_all(&mut self) -> Vec<T> {
        self.count = 0;
        self.entries.drain(..).collect()
    }

    /// Iterate front to back
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Get count
    pub fn len(&self) -> usize {
        self.count
    }

    /// Does the count match the stored entries?
    pub fn is_consistent(&self) -> bool {
        self.count == self.entries.len()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}
