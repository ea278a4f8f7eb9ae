//! A fixed-capacity round-robin run queue.
//!
//! Designed for `no_std` + `alloc` environments where the scheduler's process
//! table must never reallocate: the backing `Vec` is allocated once to
//! `capacity` during construction. Entries occupy stable slots, new entries
//! take the lowest free slot, and selection rotates through occupied slots in
//! slot order so that every eligible entry is visited exactly once per lap.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::vec::Vec;
use core::fmt;

/// The queue is at capacity and cannot accept another entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run queue is at capacity")
    }
}

/// Capacity used by the kernel's process table.
pub const DEFAULT_CAPACITY: usize = 256;

/// A fixed-capacity table of schedulable entries with a round-robin cursor.
pub struct RunQueue<T> {
    /// Backing storage, allocated once to `capacity` during construction.
    slots: Vec<Option<T>>,
    /// Slot of the most recently selected entry. Selection resumes after it.
    cursor: usize,
    /// Number of occupied slots.
    len: usize,
}

impl<T> RunQueue<T> {
    /// Create a queue with the given capacity. The backing `Vec` never grows.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RunQueue capacity must be > 0");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            cursor: 0,
            len: 0,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
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
        self.len == self.slots.len()
    }

    /// Insert into the lowest free slot and return it.
    pub fn insert(&mut self, item: T) -> Result<usize, QueueFull> {
        let slot = self
            .slots
            .iter()
            .position(|entry| entry.is_none())
            .ok_or(QueueFull)?;
        self.slots[slot] = Some(item);
        self.len += 1;
        Ok(slot)
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Remove and return the entry in `slot`, freeing it for reuse.
    pub fn remove(&mut self, slot: usize) -> Option<T> {
        let item = self.slots.get_mut(slot)?.take()?;
        self.len -= 1;
        Some(item)
    }

    /// The slot of the most recently selected entry.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Pin the cursor to `slot` so selection resumes after it.
    pub fn set_cursor(&mut self, slot: usize) {
        assert!(slot < self.slots.len());
        self.cursor = slot;
    }

    /// Round-robin selection: starting just after the cursor and wrapping
    /// through every slot (the cursor's own slot is considered last), return
    /// the first occupied slot whose entry satisfies `eligible`, and move the
    /// cursor there. Returns `None` when no entry is eligible.
    pub fn select_next(&mut self, mut eligible: impl FnMut(&T) -> bool) -> Option<usize> {
        let capacity = self.slots.len();
        for step in 1..=capacity {
            let slot = (self.cursor + step) % capacity;
            if let Some(entry) = &self.slots[slot] {
                if eligible(entry) {
                    self.cursor = slot;
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Iterate over occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|item| (slot, item)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_mut().map(|item| (slot, item)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn insert_takes_lowest_free_slot() {
        let mut queue = RunQueue::new(4);
        assert_eq!(queue.insert('a'), Ok(0));
        assert_eq!(queue.insert('b'), Ok(1));
        assert_eq!(queue.remove(0), Some('a'));
        assert_eq!(queue.insert('c'), Ok(0));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn insert_fails_at_capacity() {
        let mut queue = RunQueue::new(2);
        queue.insert(1).unwrap();
        queue.insert(2).unwrap();
        assert_eq!(queue.insert(3), Err(QueueFull));
        assert!(queue.is_full());
    }

    #[test]
    fn rotation_alternates_between_two_entries() {
        // Slot 0 holds an ineligible entry (the seed), slots 1 and 2 the
        // two eligible ones: selection must go A,B,A,B,A,B.
        let mut queue = RunQueue::new(8);
        queue.insert("root").unwrap();
        let a = queue.insert("a").unwrap();
        let b = queue.insert("b").unwrap();

        let mut order = vec![];
        for _ in 0..6 {
            let slot = queue.select_next(|entry| *entry != "root").unwrap();
            order.push(slot);
        }
        assert_eq!(order, vec![a, b, a, b, a, b]);
    }

    #[test]
    fn select_next_skips_ineligible_and_empty_slots() {
        let mut queue = RunQueue::new(8);
        queue.insert(0).unwrap();
        queue.insert(1).unwrap();
        queue.insert(2).unwrap();
        queue.remove(1);

        // Only even entries are eligible; slot 1 is a hole.
        assert_eq!(queue.select_next(|v| v % 2 == 0), Some(2));
        assert_eq!(queue.select_next(|v| v % 2 == 0), Some(0));
        assert_eq!(queue.select_next(|_| false), None);
    }

    #[test]
    fn cursor_slot_is_considered_last() {
        let mut queue = RunQueue::new(4);
        queue.insert('x').unwrap();
        queue.set_cursor(0);
        // With a single eligible entry the cursor re-selects it.
        assert_eq!(queue.select_next(|_| true), Some(0));
    }

    proptest! {
        /// Over any window of n*k selections with n eligible entries, each
        /// entry is selected exactly k times.
        #[test]
        fn round_robin_is_fair(n in 1usize..8, k in 1usize..16, seed in 0usize..8) {
            let mut queue = RunQueue::new(16);
            for i in 0..n {
                queue.insert(i).unwrap();
            }
            queue.set_cursor(seed % n);

            let mut counts: HashMap<usize, usize> = HashMap::new();
            for _ in 0..n * k {
                let slot = queue.select_next(|_| true).unwrap();
                *counts.entry(slot).or_default() += 1;
            }
            for i in 0..n {
                prop_assert_eq!(counts.get(&i).copied().unwrap_or(0), k);
            }
        }
    }
}
