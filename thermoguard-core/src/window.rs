//! Window Aggregator
//!
//! ## Overview
//!
//! Tumbling-window rollups per zone, and per sensor when enabled. Each
//! accepted reading updates its open bucket in O(1); a ticker closes buckets
//! once their end plus the grace period has passed.
//!
//! ```text
//!   bucket_start = ⌊timestamp / duration⌋ · duration
//!
//!   |── bucket k ──|── bucket k+1 ──|── bucket k+2 ──|
//!                  ^ end of k       ^ now - grace
//!                    k closable       k+1 closable
//! ```
//!
//! ## Guarantees
//!
//! - Every bucket of a key is emitted at most once, in start order.
//! - A key that stops reporting keeps emitting `count = 0` windows so
//!   consumers see the gap, up to `max_empty_buckets` in a row; then it goes
//!   dormant until its next reading.
//! - Readings for a bucket that was already emitted are rejected as
//!   `LateArrival` and counted.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::config::WindowConfig;
use crate::errors::{TelemetryError, TelemetryResult};
use crate::reading::Reading;
use crate::time::{bucket_start, Timestamp};

/// Aggregation key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowKey {
    pub zone_id: String,
    /// `Some` for per-sensor windows
    pub sensor_id: Option<String>,
}

impl WindowKey {
    pub fn zone(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            sensor_id: None,
        }
    }

    pub fn sensor(zone_id: impl Into<String>, sensor_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            sensor_id: Some(sensor_id.into()),
        }
    }
}

/// A closed, immutable window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub zone_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    pub bucket_start: Timestamp,
    pub bucket_duration: i64,
    pub count: u64,
    pub sum: f64,
    /// `None` for empty windows
    pub max: Option<f64>,
    pub min: Option<f64>,
}

impl Window {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn bucket_end(&self) -> Timestamp {
        self.bucket_start + self.bucket_duration
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn key(&self) -> WindowKey {
        WindowKey {
            zone_id: self.zone_id.clone(),
            sensor_id: self.sensor_id.clone(),
        }
    }

    fn empty(key: &WindowKey, bucket_start: Timestamp, bucket_duration: i64) -> Self {
        Self {
            zone_id: key.zone_id.clone(),
            sensor_id: key.sensor_id.clone(),
            bucket_start,
            bucket_duration,
            count: 0,
            sum: 0.0,
            max: None,
            min: None,
        }
    }
}

/// Running totals of an open bucket
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn into_window(self, key: &WindowKey, bucket_start: Timestamp, duration: i64) -> Window {
        let mut window = Window::empty(key, bucket_start, duration);
        window.count = self.count;
        window.sum = self.sum;
        if self.count > 0 {
            window.min = Some(self.min);
            window.max = Some(self.max);
        }
        window
    }
}

#[derive(Debug, Clone, Default)]
struct KeyState {
    /// Every bucket starting before this has been emitted
    closed_through: Option<Timestamp>,
    /// Empty windows emitted since the last reading
    consecutive_empty: usize,
    dormant: bool,
}

/// Tumbling window aggregator
///
/// Owned by a single task; not shared.
#[derive(Debug)]
pub struct WindowAggregator {
    duration: i64,
    grace: i64,
    per_sensor: bool,
    max_empty_buckets: usize,

    open: BTreeMap<(Timestamp, WindowKey), Accumulator>,
    keys: HashMap<WindowKey, KeyState>,

    late_arrivals: u64,
}

impl WindowAggregator {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            duration: config.duration_ms.max(1),
            grace: config.grace_ms.max(0),
            per_sensor: config.per_sensor,
            max_empty_buckets: config.max_empty_buckets,
            open: BTreeMap::new(),
            keys: HashMap::new(),
            late_arrivals: 0,
        }
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn late_arrivals(&self) -> u64 {
        self.late_arrivals
    }

    /// Buckets currently accumulating
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Add a reading to its zone (and sensor) bucket
    ///
    /// Fails with `LateArrival` if the zone bucket was already emitted; a
    /// still-open per-sensor bucket is updated regardless.
    pub fn record(&mut self, reading: &Reading) -> TelemetryResult<()> {
        let start = bucket_start(reading.timestamp, self.duration);

        let mut late = None;
        let zone_key = WindowKey::zone(reading.zone_id.as_str());
        if !self.add(zone_key, start, reading.value) {
            late = Some(start);
        }
        if self.per_sensor {
            let sensor_key = WindowKey::sensor(reading.zone_id.as_str(), reading.sensor_id.as_str());
            if !self.add(sensor_key, start, reading.value) && late.is_none() {
                late = Some(start);
            }
        }

        match late {
            Some(bucket_start) => {
                self.late_arrivals += 1;
                log::warn!(
                    "Late reading {}@{} for closed bucket {} of zone {}",
                    reading.sensor_id, reading.timestamp, bucket_start, reading.zone_id
                );
                Err(TelemetryError::LateArrival { bucket_start })
            }
            None => Ok(()),
        }
    }

    /// Returns `false` if the bucket was already emitted
    fn add(&mut self, key: WindowKey, start: Timestamp, value: f64) -> bool {
        let state = self.keys.entry(key.clone()).or_default();
        if state.closed_through.map_or(false, |closed| start < closed) {
            return false;
        }
        if state.dormant {
            // Skip the silent gap instead of back-filling it with empties
            state.dormant = false;
            state.consecutive_empty = 0;
            state.closed_through = Some(start);
        }
        self.open
            .entry((start, key))
            .or_insert_with(Accumulator::new)
            .add(value);
        true
    }

    /// Close every bucket whose end plus grace is at or before `now`
    ///
    /// Output is ordered by bucket start, then key.
    pub fn close_expired(&mut self, now: Timestamp) -> Vec<Window> {
        let boundary = bucket_start(now - self.grace, self.duration);
        self.close_before(boundary)
    }

    /// Emit every open bucket, e.g. on shutdown
    pub fn flush_all(&mut self) -> Vec<Window> {
        let boundary = match self.open.keys().next_back() {
            Some((start, _)) => start + self.duration,
            None => return Vec::new(),
        };

        let mut closed = self.take_open_before(boundary);
        let mut out = Vec::new();
        for (key, state) in self.keys.iter_mut() {
            if let Some(windows) = closed.remove(key) {
                if let Some(last) = windows.last() {
                    state.closed_through = Some(last.bucket_end());
                }
                out.extend(windows);
            }
        }
        sort_windows(&mut out);
        log::info!("Flushed {} open windows", out.len());
        out
    }

    fn take_open_before(&mut self, boundary: Timestamp) -> HashMap<WindowKey, Vec<Window>> {
        let mut closed: HashMap<WindowKey, Vec<Window>> = HashMap::new();
        while let Some(entry) = self.open.first_entry() {
            if entry.key().0 >= boundary {
                break;
            }
            let ((start, key), acc) = entry.remove_entry();
            let window = acc.into_window(&key, start, self.duration);
            closed.entry(key).or_default().push(window);
        }
        closed
    }

    fn close_before(&mut self, boundary: Timestamp) -> Vec<Window> {
        let mut closed = self.take_open_before(boundary);
        let duration = self.duration;
        let cap = self.max_empty_buckets;
        let mut out = Vec::new();

        for (key, state) in self.keys.iter_mut() {
            let windows = closed.remove(key).unwrap_or_default();

            let mut cursor = match (state.closed_through, windows.first()) {
                (Some(closed), _) => closed,
                (None, Some(first)) => first.bucket_start,
                (None, None) => continue,
            };
            if cursor >= boundary && windows.is_empty() {
                continue;
            }

            for window in windows {
                emit_empties(&mut out, key, state, cursor, window.bucket_start, duration, cap);
                cursor = window.bucket_end();
                state.consecutive_empty = 0;
                state.dormant = false;
                out.push(window);
            }
            emit_empties(&mut out, key, state, cursor, boundary, duration, cap);
            state.closed_through = Some(cursor.max(boundary));
        }

        sort_windows(&mut out);
        out
    }
}

/// Empty windows for buckets `[from, to)` of an idle key, capped
fn emit_empties(
    out: &mut Vec<Window>,
    key: &WindowKey,
    state: &mut KeyState,
    from: Timestamp,
    to: Timestamp,
    duration: i64,
    cap: usize,
) {
    if state.dormant || to <= from {
        return;
    }
    let gap = ((to - from) / duration) as usize;
    let allowed = cap.saturating_sub(state.consecutive_empty);
    let emitted = gap.min(allowed);

    for i in 0..emitted {
        out.push(Window::empty(key, from + i as i64 * duration, duration));
    }
    state.consecutive_empty += emitted;

    if gap > emitted || state.consecutive_empty >= cap {
        state.dormant = true;
        log::debug!(
            "Window key {}/{} idle, empty emission paused",
            key.zone_id,
            key.sensor_id.as_deref().unwrap_or("*")
        );
    }
}

fn sort_windows(windows: &mut [Window]) {
    windows.sort_by(|a, b| {
        a.bucket_start
            .cmp(&b.bucket_start)
            .then_with(|| a.zone_id.cmp(&b.zone_id))
            .then_with(|| a.sensor_id.cmp(&b.sensor_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Position;

    const MINUTE: i64 = 60_000;

    fn aggregator(per_sensor: bool) -> WindowAggregator {
        WindowAggregator::new(&WindowConfig {
            duration_ms: MINUTE,
            grace_ms: 0,
            per_sensor,
            max_empty_buckets: 3,
            tick_interval_ms: 1000,
        })
    }

    fn reading(sensor: &str, zone: &str, ts: i64, value: f64) -> Reading {
        Reading::celsius(sensor, zone, Position::planar(0.0, 0.0), ts, value)
    }

    #[test]
    fn closed_window_statistics() {
        let mut agg = aggregator(false);
        for (i, v) in [20.0, 22.0, 24.0].iter().enumerate() {
            agg.record(&reading("s1", "cold-aisle-1", 1000 + i as i64 * 1000, *v)).unwrap();
        }

        assert!(agg.close_expired(MINUTE - 1).is_empty());
        let windows = agg.close_expired(MINUTE);
        assert_eq!(windows.len(), 1);

        let w = &windows[0];
        assert_eq!(w.zone_id, "cold-aisle-1");
        assert_eq!(w.bucket_start, 0);
        assert_eq!(w.bucket_duration, MINUTE);
        assert_eq!(w.count, 3);
        assert_eq!(w.sum, 66.0);
        assert_eq!(w.max, Some(24.0));
        assert_eq!(w.min, Some(20.0));
        assert_eq!(w.mean(), Some(22.0));
    }

    #[test]
    fn emitted_exactly_once() {
        let mut agg = aggregator(false);
        agg.record(&reading("s1", "z", 500, 21.0)).unwrap();

        assert_eq!(agg.close_expired(MINUTE).len(), 1);
        // Same boundary again: nothing new
        assert!(agg.close_expired(MINUTE + 10).is_empty());
    }

    #[test]
    fn late_arrival_is_rejected_and_counted() {
        let mut agg = aggregator(false);
        agg.record(&reading("s1", "z", 500, 21.0)).unwrap();
        agg.close_expired(MINUTE);

        let err = agg.record(&reading("s1", "z", 1500, 22.0)).unwrap_err();
        assert_eq!(err, TelemetryError::LateArrival { bucket_start: 0 });
        assert_eq!(agg.late_arrivals(), 1);

        // Out-of-order but still open is fine
        agg.record(&reading("s1", "z", MINUTE + 5000, 22.0)).unwrap();
        agg.record(&reading("s1", "z", MINUTE + 1000, 22.0)).unwrap();
    }

    #[test]
    fn idle_zone_emits_empty_windows_up_to_cap() {
        let mut agg = aggregator(false);
        agg.record(&reading("s1", "z", 0, 21.0)).unwrap();

        let windows = agg.close_expired(10 * MINUTE);
        let counts: Vec<u64> = windows.iter().map(|w| w.count).collect();
        assert_eq!(counts, vec![1, 0, 0, 0]);
        assert!(windows[1].max.is_none() && windows[1].mean().is_none());
        assert_eq!(windows[3].bucket_start, 3 * MINUTE);

        // Dormant: no further empties
        assert!(agg.close_expired(20 * MINUTE).is_empty());

        // Reading wakes the key without back-filling the gap
        agg.record(&reading("s1", "z", 25 * MINUTE, 23.0)).unwrap();
        let windows = agg.close_expired(26 * MINUTE);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].bucket_start, 25 * MINUTE);
    }

    #[test]
    fn per_sensor_windows() {
        let mut agg = aggregator(true);
        agg.record(&reading("s1", "z", 100, 20.0)).unwrap();
        agg.record(&reading("s2", "z", 200, 30.0)).unwrap();

        let windows = agg.close_expired(MINUTE);
        assert_eq!(windows.len(), 3);
        let zone = windows.iter().find(|w| w.sensor_id.is_none()).unwrap();
        assert_eq!(zone.count, 2);
        assert_eq!(zone.mean(), Some(25.0));
        let s2 = windows
            .iter()
            .find(|w| w.sensor_id.as_deref() == Some("s2"))
            .unwrap();
        assert_eq!(s2.sum, 30.0);
    }

    #[test]
    fn grace_delays_closing() {
        let mut agg = WindowAggregator::new(&WindowConfig {
            duration_ms: MINUTE,
            grace_ms: 5000,
            ..WindowConfig::default()
        });
        agg.record(&reading("s1", "z", 100, 20.0)).unwrap();

        assert!(agg.close_expired(MINUTE + 4999).is_empty());
        // Still open, so a slightly late reading lands in it
        agg.record(&reading("s1", "z", 59_000, 22.0)).unwrap();
        let windows = agg.close_expired(MINUTE + 5000);
        assert_eq!(windows[0].count, 2);
    }

    #[test]
    fn flush_emits_open_buckets() {
        let mut agg = aggregator(false);
        agg.record(&reading("s1", "a", 100, 20.0)).unwrap();
        agg.record(&reading("s1", "b", MINUTE + 100, 21.0)).unwrap();

        let windows = agg.flush_all();
        assert_eq!(windows.len(), 2);
        assert_eq!(agg.open_count(), 0);
        assert!(agg.flush_all().is_empty());

        // Flushed buckets are closed for good
        assert!(agg.record(&reading("s1", "a", 200, 20.0)).is_err());
    }

    #[test]
    fn negative_timestamps_bucket_down() {
        let mut agg = aggregator(false);
        agg.record(&reading("s1", "z", -1, 20.0)).unwrap();
        let windows = agg.close_expired(0);
        assert_eq!(windows[0].bucket_start, -MINUTE);
    }
}
