//! Time management for the telemetry pipeline
//!
//! Two notions of time exist side by side:
//! - **Event time**: the `timestamp` carried by each reading. Window buckets
//!   and alert dwell times are measured in event time.
//! - **Processing time**: what the background ticker sees. It decides when an
//!   idle bucket is old enough to close.
//!
//! Both are plain milliseconds since the Unix epoch.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Timestamp in milliseconds since epoch
pub type Timestamp = i64;

/// Source of processing time
pub trait TimeSource: Send + Sync {
    /// Get current timestamp in milliseconds
    fn now(&self) -> Timestamp;

    /// Check if this source provides wall clock time
    fn is_wall_clock(&self) -> bool;
}

/// Wall clock time source
#[derive(Debug, Clone, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> Timestamp {
        use std::time::{SystemTime as StdSystemTime, UNIX_EPOCH};

        StdSystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }

    fn is_wall_clock(&self) -> bool {
        true
    }
}

/// Manually driven clock for tests and replays
///
/// Clones share the same underlying instant, so a test can hand one copy to
/// the pipeline and advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    pub fn set(&self, timestamp: Timestamp) {
        self.now.store(timestamp, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    fn is_wall_clock(&self) -> bool {
        false
    }
}

/// Round a timestamp down to the start of its bucket
///
/// Works for timestamps before the epoch too (floor, not truncation).
pub fn bucket_start(timestamp: Timestamp, duration_ms: i64) -> Timestamp {
    timestamp.div_euclid(duration_ms) * duration_ms
}

/// Convert delta to rate per second
pub fn rate_per_second(value_delta: f64, time_delta_ms: i64) -> f64 {
    if time_delta_ms == 0 {
        return 0.0;
    }

    value_delta * 1000.0 / time_delta_ms as f64
}
