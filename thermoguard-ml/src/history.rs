//! Fixed-Size Sample History
//!
//! ## Overview
//!
//! Pattern matchers only ever look at the last few minutes of a sensor, so
//! each sensor keeps a short, fixed-capacity history instead of its full
//! series. Pushing into a full history overwrites the oldest sample:
//!
//! ```text
//! History<4>, push (t5, v5):
//!
//! ┌────────┬────────┬────────┬────────┐      ┌────────┬────────┬────────┬────────┐
//! │ t1, v1 │ t2, v2 │ t3, v3 │ t4, v4 │ ───→ │ t2, v2 │ t3, v3 │ t4, v4 │ t5, v5 │
//! └────────┴────────┴────────┴────────┘      └────────┴────────┴────────┴────────┘
//! ```
//!
//! Samples are kept in timestamp order. A sample older than the newest one
//! already held is ignored; the baseline still sees it, the matchers do not.
//!
//! Storage is a `heapless::Deque`, so a history never allocates after
//! construction and its footprint is known up front (16 bytes per slot).

use heapless::Deque;
use serde::Serialize;

use thermoguard_core::Timestamp;

/// Default number of samples kept per sensor
pub const HISTORY_CAPACITY: usize = 128;

/// One timestamped value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Sample {
    pub const fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Time-ordered ring of the most recent samples
#[derive(Debug, Clone)]
pub struct History<const N: usize = HISTORY_CAPACITY> {
    samples: Deque<Sample, N>,
}

impl<const N: usize> Default for History<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> History<N> {
    pub const fn new() -> Self {
        Self {
            samples: Deque::new(),
        }
    }

    /// Append a sample, evicting the oldest when full
    ///
    /// Returns `false` when the sample is older than the newest one held.
    pub fn push(&mut self, sample: Sample) -> bool {
        if self.samples.back().map_or(false, |last| sample.timestamp < last.timestamp) {
            return false;
        }
        if self.samples.is_full() {
            self.samples.pop_front();
        }
        // Cannot fail: a slot was just freed
        let _ = self.samples.push_back(sample);
        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Most recent sample
    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// All samples, oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Samples with `timestamp >= since`, oldest first
    pub fn since(&self, since: Timestamp) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(move |s| s.timestamp >= since)
    }

    /// The newest `n` values, oldest first; fewer if not enough are held
    pub fn latest_values(&self, n: usize) -> Vec<f64> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).map(|s| s.value).collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_oldest_when_full() {
        let mut history: History<3> = History::new();
        for t in 0..5 {
            assert!(history.push(Sample::new(t * 1000, t as f64)));
        }
        assert_eq!(history.len(), 3);
        let values: Vec<f64> = history.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert_eq!(history.last().map(|s| s.timestamp), Some(4000));
    }

    #[test]
    fn rejects_out_of_order_samples() {
        let mut history: History<8> = History::new();
        history.push(Sample::new(2000, 1.0));
        assert!(!history.push(Sample::new(1000, 2.0)));
        assert!(history.push(Sample::new(2000, 3.0)));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn since_and_latest() {
        let mut history: History<8> = History::new();
        for t in 0..6 {
            history.push(Sample::new(t * 10, t as f64));
        }
        assert_eq!(history.since(30).count(), 3);
        assert_eq!(history.latest_values(2), vec![4.0, 5.0]);
        assert_eq!(history.latest_values(100).len(), 6);
    }
}
