//! Event ordering buffer.
//!
//! Holds events of one experiment in a min-heap keyed by
//! `(observed_at, sequence_hint, arrival)` and releases them in key order
//! once the watermark has passed since the newest arrival, or once the
//! buffer is full. The buffer never reads the clock; callers pass `now`.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Sort key of a buffered item. `arrival` breaks ties in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OrderKey {
    pub observed_at_micros: i64,
    pub sequence_hint: i64,
    pub arrival: u64,
}

/// An item leaving the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released<T> {
    pub key: OrderKey,
    pub item: T,
    /// Sorts below an item this buffer already released.
    pub out_of_order: bool,
}

struct Entry<T> {
    key: OrderKey,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Per-experiment reordering buffer.
pub struct OrderingBuffer<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    watermark: Duration,
    max_size: usize,
    next_arrival: u64,
    newest_arrival: Option<Instant>,
    high_water: Option<OrderKey>,
}

impl<T> OrderingBuffer<T> {
    /// `max_size` is clamped to at least 1.
    #[must_use]
    pub fn new(watermark: Duration, max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            watermark,
            max_size: max_size.max(1),
            next_arrival: 0,
            newest_arrival: None,
            high_water: None,
        }
    }

    /// Add an item that arrived at `now`.
    pub fn push(
        &mut self,
        observed_at_micros: i64,
        sequence_hint: i64,
        item: T,
        now: Instant,
    ) -> OrderKey {
        let key = OrderKey {
            observed_at_micros,
            sequence_hint,
            arrival: self.next_arrival,
        };
        self.next_arrival = self.next_arrival.saturating_add(1);
        self.newest_arrival = Some(now);
        self.heap.push(Reverse(Entry { key, item }));
        key
    }

    /// Release the oldest items while the buffer is at or above capacity.
    pub fn pop_overflow(&mut self) -> Vec<Released<T>> {
        let mut released = Vec::new();
        while self.heap.len() >= self.max_size {
            match self.pop_min() {
                Some(item) => released.push(item),
                None => break,
            }
        }
        released
    }

    /// Release everything if the watermark has passed since the newest
    /// arrival.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Released<T>> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.drain(),
            _ => Vec::new(),
        }
    }

    /// Release everything in key order.
    pub fn drain(&mut self) -> Vec<Released<T>> {
        let mut released = Vec::with_capacity(self.heap.len());
        while let Some(item) = self.pop_min() {
            released.push(item);
        }
        released
    }

    /// When the buffered items become due, if any are held.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        if self.heap.is_empty() {
            return None;
        }
        self.newest_arrival
            .and_then(|newest| newest.checked_add(self.watermark))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[must_use]
    pub const fn watermark(&self) -> Duration {
        self.watermark
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    fn pop_min(&mut self) -> Option<Released<T>> {
        let Reverse(Entry { key, item }) = self.heap.pop()?;
        let out_of_order = self.high_water.is_some_and(|high| key < high);
        if !out_of_order {
            self.high_water = Some(key);
        }
        Some(Released {
            key,
            item,
            out_of_order,
        })
    }
}

impl<T> std::fmt::Debug for OrderingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderingBuffer")
            .field("len", &self.heap.len())
            .field("watermark", &self.watermark)
            .field("max_size", &self.max_size)
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}
