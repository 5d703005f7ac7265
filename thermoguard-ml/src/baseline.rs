//! Trailing Baselines
//!
//! ## Overview
//!
//! A sensor's "normal" is the mean and standard deviation of its readings
//! over a trailing horizon (24 h by default). Recomputing that over raw
//! samples on every reading is O(n); instead the horizon is split into
//! sub-buckets, each holding a Welford accumulator:
//!
//! ```text
//!   horizon = 24 h, 24 buckets of 1 h
//!
//!   ┌──────┬──────┬──────┬─────┬──────┬──────┐
//!   │ W₀   │ W₁   │ W₂   │ ... │ W₂₂  │ W₂₃  │ ← current bucket
//!   └──────┴──────┴──────┴─────┴──────┴──────┘
//!      ▲ expires when `now - horizon` passes its end
//! ```
//!
//! Adding a sample is O(1). Reading the baseline merges at most `buckets`
//! accumulators with Chan's parallel combination, so the cost is bounded by
//! the bucket count, not the sample count. The horizon edge is quantized to
//! one bucket; with 24 buckets that is a 1 h granularity on a 24 h horizon.
//!
//! ## Welford
//!
//! ```text
//! n'    = n + 1
//! δ     = x - mean
//! mean' = mean + δ / n'
//! M2'   = M2 + δ · (x - mean')
//! var   = M2 / n
//! ```
//!
//! Numerically stable for long runs of near-identical values, which is the
//! normal case for a well-behaved temperature sensor.

use std::collections::VecDeque;

use serde::Serialize;

use thermoguard_core::time::bucket_start;
use thermoguard_core::Timestamp;

/// Incremental mean and variance
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Combine two accumulators as if all samples went into one
    pub fn merge(&mut self, other: &Welford) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let n_a = self.count as f64;
        let n_b = other.count as f64;
        self.mean += delta * n_b / count as f64;
        self.m2 += other.m2 + delta * delta * n_a * n_b / count as f64;
        self.count = count;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        libm::sqrt(self.variance())
    }
}

/// Baseline statistics at one instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineStats {
    pub mean: f64,
    pub std_dev: f64,
    pub samples: u64,
}

/// Bucketed trailing baseline
#[derive(Debug, Clone)]
pub struct TrailingBaseline {
    horizon_ms: i64,
    bucket_ms: i64,
    /// (bucket start, accumulator), oldest first
    buckets: VecDeque<(Timestamp, Welford)>,
}

impl TrailingBaseline {
    pub fn new(horizon_ms: i64, buckets: usize) -> Self {
        let horizon_ms = horizon_ms.max(1);
        let bucket_ms = (horizon_ms / buckets.max(1) as i64).max(1);
        Self {
            horizon_ms,
            bucket_ms,
            buckets: VecDeque::new(),
        }
    }

    /// Add a sample
    ///
    /// Samples older than the horizon relative to the newest bucket are
    /// ignored; an out-of-order sample inside the horizon lands in its own
    /// bucket.
    pub fn observe(&mut self, timestamp: Timestamp, value: f64) {
        let start = bucket_start(timestamp, self.bucket_ms);

        match self.buckets.back() {
            Some(&(newest, _)) if start > newest => {
                self.buckets.push_back((start, Welford::default()));
            }
            None => self.buckets.push_back((start, Welford::default())),
            _ => {}
        }

        let newest = self.buckets.back().map_or(start, |&(s, _)| s);
        if start <= newest - self.horizon_ms {
            return;
        }

        match self.buckets.binary_search_by_key(&start, |&(s, _)| s) {
            Ok(i) => self.buckets[i].1.update(value),
            Err(i) => {
                let mut acc = Welford::default();
                acc.update(value);
                self.buckets.insert(i, (start, acc));
            }
        }
        self.expire(newest + self.bucket_ms);
    }

    /// Drop buckets that ended before `now - horizon`
    pub fn expire(&mut self, now: Timestamp) {
        let cutoff = now - self.horizon_ms;
        while let Some(&(start, _)) = self.buckets.front() {
            if start + self.bucket_ms <= cutoff {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Mean and standard deviation over every live bucket
    pub fn stats(&self) -> BaselineStats {
        let mut total = Welford::default();
        for (_, acc) in &self.buckets {
            total.merge(acc);
        }
        BaselineStats {
            mean: total.mean(),
            std_dev: total.std_dev(),
            samples: total.count(),
        }
    }

    pub fn bucket_ms(&self) -> i64 {
        self.bucket_ms
    }

    pub fn live_buckets(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 60 * 60 * 1000;

    #[test]
    fn welford_matches_direct_computation() {
        let values = [20.0, 22.0, 24.0, 21.0, 23.0];
        let mut acc = Welford::default();
        values.iter().for_each(|&v| acc.update(v));

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        assert!((acc.mean() - mean).abs() < 1e-12);
        assert!((acc.variance() - var).abs() < 1e-12);
    }

    #[test]
    fn merge_equals_single_pass() {
        let (left, right) = ([1.0, 2.0, 3.0], [10.0, 11.0]);
        let mut a = Welford::default();
        let mut b = Welford::default();
        let mut all = Welford::default();
        left.iter().for_each(|&v| {
            a.update(v);
            all.update(v);
        });
        right.iter().for_each(|&v| {
            b.update(v);
            all.update(v);
        });

        a.merge(&b);
        assert_eq!(a.count(), 5);
        assert!((a.mean() - all.mean()).abs() < 1e-12);
        assert!((a.variance() - all.variance()).abs() < 1e-9);
    }

    #[test]
    fn old_buckets_expire() {
        let mut baseline = TrailingBaseline::new(24 * HOUR, 24);
        baseline.observe(0, 100.0);
        for h in 1..=24 {
            baseline.observe(h * HOUR, 20.0);
        }
        // The hour-0 bucket ended exactly at the horizon edge
        let stats = baseline.stats();
        assert_eq!(stats.samples, 24);
        assert!((stats.mean - 20.0).abs() < 1e-12);
        assert!(baseline.live_buckets() <= 25);
    }

    #[test]
    fn ancient_samples_are_ignored() {
        let mut baseline = TrailingBaseline::new(HOUR, 4);
        baseline.observe(10 * HOUR, 20.0);
        baseline.observe(0, 90.0);
        assert_eq!(baseline.stats().samples, 1);
    }

    #[test]
    fn out_of_order_sample_inside_horizon_counts() {
        let mut baseline = TrailingBaseline::new(4 * HOUR, 4);
        baseline.observe(3 * HOUR, 20.0);
        baseline.observe(HOUR, 22.0);
        let stats = baseline.stats();
        assert_eq!(stats.samples, 2);
        assert!((stats.mean - 21.0).abs() < 1e-12);
    }
}
