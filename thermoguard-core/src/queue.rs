//! Bounded drop-oldest queue
//!
//! ## Overview
//!
//! A bounded FIFO that never rejects a push: when full, the oldest element is
//! evicted to make room. This is the right policy for live telemetry going to
//! an observer, where the newest state matters more than history, and it
//! keeps the producer from ever waiting on a slow consumer.
//!
//! ```text
//!   capacity 4, push E:
//!
//!   ┌───┬───┬───┬───┐          ┌───┬───┬───┬───┐
//!   │ A │ B │ C │ D │  ──────→ │ B │ C │ D │ E │   A evicted, dropped += 1
//!   └───┴───┴───┴───┘          └───┴───┴───┴───┘
//! ```
//!
//! The critical section is a `VecDeque` push or pop; no I/O happens under
//! the lock. Statistics are atomics so they can be polled without it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::shard::lock;

/// Queue counters
///
/// Track queue health without taking the queue lock
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total elements pushed
    pub pushed: AtomicU64,
    /// Total elements popped
    pub popped: AtomicU64,
    /// Elements evicted because the queue was full
    pub dropped: AtomicU64,
    /// Maximum depth seen
    pub max_depth: AtomicUsize,
}

impl QueueStats {
    /// Update max depth if current is higher
    fn update_max_depth(&self, current: usize) {
        let mut max = self.max_depth.load(Ordering::Relaxed);
        while current > max {
            match self.max_depth.compare_exchange_weak(
                max,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => max = actual,
            }
        }
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            max_depth: self.max_depth.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`QueueStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsSnapshot {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub max_depth: usize,
}

/// Bounded FIFO evicting its oldest element on overflow
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    stats: QueueStats,
}

impl<T> DropOldestQueue<T> {
    /// Capacity is at least one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            stats: QueueStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `item`; returns the evicted element when the queue was full
    pub fn push(&self, item: T) -> Option<T> {
        let mut items = lock(&self.items);
        let evicted = if items.len() >= self.capacity {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        let depth = items.len();
        drop(items);

        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        self.stats.update_max_depth(depth);
        evicted
    }

    pub fn pop(&self) -> Option<T> {
        let item = lock(&self.items).pop_front();
        if item.is_some() {
            self.stats.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Take everything currently queued, oldest first
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = lock(&self.items).drain(..).collect();
        self.stats
            .popped
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Discard everything queued without counting it as delivered
    pub fn clear(&self) -> usize {
        let mut items = lock(&self.items);
        let n = items.len();
        items.clear();
        n
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let queue = DropOldestQueue::new(8);
        for i in 0..5 {
            assert!(queue.push(i).is_none());
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.drain(), vec![1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_evicts_oldest() {
        let queue = DropOldestQueue::new(3);
        for i in 0..3 {
            queue.push(i);
        }
        assert_eq!(queue.push(3), Some(0));
        assert_eq!(queue.push(4), Some(1));

        assert_eq!(queue.drain(), vec![2, 3, 4]);
        let stats = queue.stats().snapshot();
        assert_eq!(stats.pushed, 5);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.max_depth, 3);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = DropOldestQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push("a");
        assert_eq!(queue.push("b"), Some("a"));
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity() {
        let queue = Arc::new(DropOldestQueue::new(16));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        q.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = queue.stats().snapshot();
        assert_eq!(stats.pushed, 4000);
        assert_eq!(stats.dropped, 4000 - 16);
        assert_eq!(queue.len(), 16);
        assert!(stats.max_depth <= 16);
    }
}
