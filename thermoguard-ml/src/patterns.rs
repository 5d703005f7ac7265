//! Pattern Matchers
//!
//! ## Overview
//!
//! Point scores catch spikes. Slower failure modes need shape:
//!
//! | Matcher | Looks for | Typical cause |
//! |---------|-----------|---------------|
//! | [`OscillationMatcher`] | ≥ N direction changes with real amplitude inside a short window | hunting thermostat, failing compressor cycling |
//! | [`GradualRiseMatcher`] | sustained positive linear trend above a rate floor | clogged filter, fan degradation |
//! | [`correlation`] | a sensor no longer moving with its spatial neighbours | drifting or detached probe, local hot spot |
//!
//! Every matcher returns a confidence in `[0, 1]`, or `None` when there is
//! not enough data to judge. A matcher that fires reports at least
//! [`FIRING_CONFIDENCE`]; stronger evidence pushes the confidence towards 1.
//! Matchers are independent of each other and may all fire for the same
//! sensor at once.
//!
//! ## Oscillation
//!
//! ```text
//!   value
//!     │    ╱╲      ╱╲
//!     │   ╱  ╲    ╱  ╲    ╱      derivative signs: + - + - +
//!     │  ╱    ╲  ╱    ╲  ╱       sign changes:       4
//!     │ ╱      ╲╱      ╲╱        amplitude:  max - min
//!     └────────────────────── t
//! ```
//!
//! Flat steps (zero derivative) carry the previous sign, so a plateau at a
//! peak counts as one change, not two.
//!
//! ## Gradual Rise
//!
//! Ordinary least squares over the samples in the window, with time in
//! minutes, gives a slope in °C/min. The fit must also explain most of the
//! variance (R² ≥ [`MIN_TREND_FIT`]) for the rise to count as sustained.
//!
//! ## Correlation
//!
//! The last `min_samples` values of the sensor and of each neighbour are
//! z-scored and compared by Pearson correlation. A low mean correlation
//! means the sensor is moving on its own.

use thermoguard_core::config::{CorrelationConfig, GradualRiseConfig, OscillationConfig};
use thermoguard_core::{AnomalyKind, Timestamp};

use crate::history::History;

/// Lowest confidence a firing matcher reports
pub const FIRING_CONFIDENCE: f64 = 0.6;

/// Coefficient of determination a trend fit needs
pub const MIN_TREND_FIT: f64 = 0.5;

/// Standard deviation below which a series counts as flat
const FLAT_EPS: f64 = 1e-9;

/// Map evidence strength in `[0, 1]` onto a firing confidence
fn firing(strength: f64) -> f64 {
    FIRING_CONFIDENCE + (1.0 - FIRING_CONFIDENCE) * strength.clamp(0.0, 1.0)
}

/// A matcher over one sensor's own history
pub trait SeriesMatcher {
    fn kind(&self) -> AnomalyKind;

    /// Confidence the pattern is present at `now`
    ///
    /// `Some(0.0)` means "looked, not present"; `None` means "not enough
    /// data to look".
    fn evaluate<const N: usize>(&self, history: &History<N>, now: Timestamp) -> Option<f64>;
}

/// Repeated direction changes with significant amplitude
#[derive(Debug, Clone)]
pub struct OscillationMatcher {
    config: OscillationConfig,
}

impl OscillationMatcher {
    pub fn new(config: &OscillationConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl SeriesMatcher for OscillationMatcher {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::Oscillation
    }

    fn evaluate<const N: usize>(&self, history: &History<N>, now: Timestamp) -> Option<f64> {
        let min_changes = self.config.min_sign_changes.max(1);
        let samples: Vec<f64> = history
            .since(now - self.config.window_ms)
            .map(|s| s.value)
            .collect();
        // n sign changes need at least n + 2 samples
        if samples.len() < min_changes + 2 {
            return None;
        }

        let mut changes = 0usize;
        let mut last_sign = 0.0f64;
        for pair in samples.windows(2) {
            let delta = pair[1] - pair[0];
            if delta == 0.0 {
                continue;
            }
            let sign = delta.signum();
            if last_sign != 0.0 && sign != last_sign {
                changes += 1;
            }
            last_sign = sign;
        }

        let (lo, hi) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let amplitude = hi - lo;

        if changes < min_changes || amplitude < self.config.amplitude_floor {
            return Some(0.0);
        }

        let extra_changes = (changes - min_changes) as f64 / min_changes as f64;
        let extra_amplitude = if self.config.amplitude_floor > 0.0 {
            amplitude / self.config.amplitude_floor - 1.0
        } else {
            1.0
        };
        Some(firing((extra_changes.min(1.0) + extra_amplitude.min(1.0)) / 2.0))
    }
}

/// Sustained positive trend
#[derive(Debug, Clone)]
pub struct GradualRiseMatcher {
    config: GradualRiseConfig,
}

/// Least squares line through a series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendFit {
    /// °C per minute
    pub slope_per_min: f64,
    /// Coefficient of determination, 1.0 = perfect line
    pub r_squared: f64,
}

impl GradualRiseMatcher {
    pub fn new(config: &GradualRiseConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Fit `value = a + slope · minutes`
    pub fn fit(points: &[(Timestamp, f64)]) -> Option<TrendFit> {
        let (t0, _) = *points.first()?;
        let n = points.len() as f64;
        if points.len() < 2 {
            return None;
        }

        let xs = points.iter().map(|&(t, _)| (t - t0) as f64 / 60_000.0);
        let mean_x = xs.clone().sum::<f64>() / n;
        let mean_y = points.iter().map(|&(_, v)| v).sum::<f64>() / n;

        let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
        for (x, &(_, y)) in xs.zip(points) {
            let dx = x - mean_x;
            let dy = y - mean_y;
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
        }
        if sxx <= 0.0 {
            return None;
        }

        let slope = sxy / sxx;
        let r_squared = if syy <= 0.0 { 0.0 } else { (sxy * sxy) / (sxx * syy) };
        Some(TrendFit {
            slope_per_min: slope,
            r_squared,
        })
    }
}

impl SeriesMatcher for GradualRiseMatcher {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::GradualRise
    }

    fn evaluate<const N: usize>(&self, history: &History<N>, now: Timestamp) -> Option<f64> {
        let points: Vec<(Timestamp, f64)> = history
            .since(now - self.config.window_ms)
            .map(|s| (s.timestamp, s.value))
            .collect();
        if points.len() < self.config.min_samples.max(2) {
            return None;
        }

        let fit = Self::fit(&points)?;
        let floor = self.config.rate_floor_per_min;
        if fit.slope_per_min < floor || fit.r_squared < MIN_TREND_FIT {
            return Some(0.0);
        }

        let excess = if floor > 0.0 {
            fit.slope_per_min / floor - 1.0
        } else {
            1.0
        };
        Some(firing(excess.min(1.0) * fit.r_squared))
    }
}

/// Pearson correlation of two equally long series
///
/// Two flat series track each other perfectly; a flat series against a
/// moving one does not track at all.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let za = z_scores(&a[a.len() - n..]);
    let zb = z_scores(&b[b.len() - n..]);
    match (za, zb) {
        (None, None) => 1.0,
        (Some(za), Some(zb)) => {
            let r = za.iter().zip(&zb).map(|(x, y)| x * y).sum::<f64>() / n as f64;
            r.clamp(-1.0, 1.0)
        }
        _ => 0.0,
    }
}

/// Standardize a series; `None` when it is flat
fn z_scores(series: &[f64]) -> Option<Vec<f64>> {
    let n = series.len() as f64;
    let mean = series.iter().sum::<f64>() / n;
    let var = series.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std_dev = libm::sqrt(var);
    if std_dev < FLAT_EPS {
        return None;
    }
    Some(series.iter().map(|v| (v - mean) / std_dev).collect())
}

/// Outcome of comparing a sensor with its neighbours
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationMatch {
    /// Mean correlation with the neighbours that had enough data
    pub mean_correlation: f64,
    /// Neighbours compared
    pub neighbors: usize,
    /// `[0, 1]`, zero when the sensor tracks its neighbours
    pub confidence: f64,
}

/// Compare a sensor's recent series with its neighbours'
///
/// `None` when the sensor or every neighbour has fewer than `min_samples`.
pub fn correlation<'a, const N: usize, I>(
    config: &CorrelationConfig,
    own: &History<N>,
    neighbors: I,
) -> Option<CorrelationMatch>
where
    I: IntoIterator<Item = &'a History<N>>,
{
    let n = config.min_samples.max(3);
    if own.len() < n {
        return None;
    }
    let series = own.latest_values(n);

    let (sum, count) = neighbors
        .into_iter()
        .filter(|h| h.len() >= n)
        .map(|h| pearson(&series, &h.latest_values(n)))
        .fold((0.0, 0usize), |(s, c), r| (s + r, c + 1));
    if count == 0 {
        return None;
    }

    let mean_correlation = sum / count as f64;
    let confidence = if mean_correlation < config.min_correlation {
        (1.0 - mean_correlation.max(0.0)).clamp(0.0, 1.0)
    } else {
        0.0
    };
    Some(CorrelationMatch {
        mean_correlation,
        neighbors: count,
        confidence,
    })
}
