//! Cycle History
//!
//! Fixed-size ring buffer of per-cycle records; the oldest record is
//! overwritten once the buffer is full.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct CycleHistory<T> {
    records: VecDeque<T>,
    capacity: usize,
}

impl<T> CycleHistory<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: T) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }

    pub fn latest(&self) -> Option<&T> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
